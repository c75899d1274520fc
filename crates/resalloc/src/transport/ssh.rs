use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};

use crate::allocation::AllocResult;
use crate::allocation::allocator::{AllocFuture, Allocator};
use crate::allocation::cluster::{ClusterTransport, HostContext, MachineDescriptor};
use crate::allocation::local::{
    DEFAULT_MAX_LOAD, DEFAULT_TOTAL_CPUS, LOCAL_ALLOCATOR_NAME, LocalAllocator,
};
use crate::allocation::probe::StaticProbe;
use crate::common::utils::network::split_host_port;
use crate::worker::launcher::ProcessLauncher;

const DEFAULT_SSH_PORT: u16 = 22;

/// Starts workers on remote machines through OpenSSH.
#[derive(Default)]
pub struct SshTransport {
    /// `None` means that `ssh` is looked up in `PATH` when a machine is connected.
    ssh: Option<PathBuf>,
}

impl SshTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(ssh: PathBuf) -> Self {
        Self { ssh: Some(ssh) }
    }

    fn ssh_binary(&self) -> anyhow::Result<PathBuf> {
        match &self.ssh {
            Some(ssh) => Ok(ssh.clone()),
            None => which::which("ssh").context("Cannot find `ssh` binary"),
        }
    }
}

impl ClusterTransport for SshTransport {
    fn connect<'a>(
        &'a self,
        machine: &'a MachineDescriptor,
    ) -> AllocFuture<'a, AllocResult<Arc<dyn HostContext>>> {
        Box::pin(async move {
            let ssh = self.ssh_binary()?;
            let (host, port) = split_host_port(&machine.hostname)?;
            let address = tokio::net::lookup_host((host, port.unwrap_or(DEFAULT_SSH_PORT)))
                .await
                .with_context(|| anyhow!("Cannot resolve {host}"))?
                .next()
                .ok_or_else(|| anyhow!("No address found for {host}"))?;
            log::debug!("Machine {} resolved to {address}", machine.hostname);

            Ok(Arc::new(SshHost {
                hostname: machine.hostname.clone(),
                address: format!("Host-{address}"),
                ssh,
                args: ssh_arguments(host, port, &machine.runtime),
            }) as Arc<dyn HostContext>)
        })
    }
}

struct SshHost {
    hostname: String,
    address: String,
    ssh: PathBuf,
    args: Vec<OsString>,
}

impl HostContext for SshHost {
    fn address(&self) -> Option<&str> {
        Some(&self.address)
    }

    fn create_allocator(&self) -> AllocFuture<'_, AllocResult<Arc<dyn Allocator>>> {
        Box::pin(async move {
            let launcher = ProcessLauncher::new(self.ssh.clone(), self.args.clone());
            Ok(Arc::new(LocalAllocator::new(
                format!("{LOCAL_ALLOCATOR_NAME}@{}", self.hostname),
                DEFAULT_TOTAL_CPUS,
                DEFAULT_MAX_LOAD,
                Arc::new(StaticProbe::default()),
                Arc::new(launcher),
            )) as Arc<dyn Allocator>)
        })
    }
}

/// Arguments passed to `ssh` before the worker arguments.
fn ssh_arguments(host: &str, port: Option<u16>, runtime: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![host.into()];
    if let Some(port) = port {
        args.push("-p".into());
        args.push(port.to_string().into());
    }
    args.push("--".into());
    args.push(runtime.into());
    args
}
