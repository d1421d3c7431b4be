//! Process control channel.

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

/// Whether a control line asks the daemon to stop.
pub fn is_exit_command(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case("exit")
}

/// Resolve on `exit` read from stdin. A closed stdin leaves only Ctrl-C.
async fn exit_command() {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_exit_command(&line) => return,
            Ok(Some(line)) => {
                if !line.trim().is_empty() {
                    warn!(command = %line.trim(), "unknown command, type `exit` to stop");
                }
            }
            Ok(None) => {
                debug!("stdin closed, control channel disabled");
                break;
            }
            Err(e) => {
                warn!(error = %e, "control channel read failed");
                break;
            }
        }
    }
    std::future::pending::<()>().await
}

/// Resolve on the first shutdown request: `exit` on stdin or Ctrl-C.
pub async fn shutdown_signal() {
    tokio::select! {
        _ = exit_command() => info!("exit command received"),
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("interrupt received"),
            Err(e) => {
                warn!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await
            }
        },
    }
}
