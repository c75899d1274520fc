use std::io::Read;

use tokio::io::AsyncWriteExt;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::oneshot;

use crate::allocation::allocator::WorkerInfo;
use crate::common::utils::network::get_hostname;

pub fn create_worker_info(name: String) -> WorkerInfo {
    WorkerInfo {
        name,
        pid: std::process::id(),
        host: get_hostname(None),
    }
}

/// Runs a worker process.
///
/// The worker reports itself with a JSON line on stdout and then runs until it receives SIGTERM
/// or Ctrl-C, or until its stdin is closed.
pub async fn run_worker(name: String) -> anyhow::Result<()> {
    let info = create_worker_info(name);
    let mut stdout = tokio::io::stdout();
    let mut line = serde_json::to_vec(&info)?;
    line.push(b'\n');
    stdout.write_all(&line).await?;
    stdout.flush().await?;
    log::info!("Worker {} started with pid {} on {}", info.name, info.pid, info.host);

    let mut sigterm = signal(SignalKind::terminate())?;
    let stdin_closed = wait_for_stdin_close();
    tokio::select! {
        _ = sigterm.recv() => log::info!("SIGTERM received"),
        _ = tokio::signal::ctrl_c() => log::info!("SIGINT received"),
        _ = stdin_closed => log::info!("Stdin closed"),
    }
    log::info!("Worker {} stopped", info.name);
    Ok(())
}

/// Resolves once stdin reaches EOF.
///
/// Reads on a detached thread, so that a pending read does not block runtime shutdown.
fn wait_for_stdin_close() -> oneshot::Receiver<()> {
    let (sender, receiver) = oneshot::channel();
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin().lock();
        let mut buffer = [0u8; 256];
        while matches!(stdin.read(&mut buffer), Ok(count) if count > 0) {}
        let _ = sender.send(());
    });
    receiver
}
