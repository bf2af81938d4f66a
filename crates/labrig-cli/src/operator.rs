//! Interactive pause before a failed target is torn down.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};

use labrig_orchestra::OperatorHook;

/// Prints the failure and waits for Enter on stdin.
pub struct StdinOperator;

#[async_trait]
impl OperatorHook for StdinOperator {
    async fn inspect(&self, failure: &str) {
        eprintln!("Failure: {}", failure);
        eprintln!("Inspect the machine, then press Enter to continue teardown.");
        let mut line = String::new();
        let mut stdin = BufReader::new(tokio::io::stdin());
        if let Err(e) = stdin.read_line(&mut line).await {
            tracing::warn!("could not read from stdin: {}", e);
        }
    }
}
