//! Node start, readiness, destruction, and reaping.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::net::Ipv4Addr;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use rand::Rng;
use serde_json::{Map, Value, json};
use shell_escape::unix::escape;
use tracing::{debug, info, warn};

use super::{
    HostAdapter, HypervisorBackend, HypervisorError, MAX_NODES, parse_vm_list, parse_vm_name,
    vm_name,
};
use crate::backend::{
    ActiveNode, NodeResult, NodeSpec, NodeSpecs, PendingAllocation, PendingAllocations, SshDetails,
};
use crate::cluster::ClusterId;
use crate::command::{CommandError, CommandRunner, os_args};
use crate::reap::{ReapError, ReapSummary, reconcile_retaining};
use crate::ssh::{find_ssh_key, read_public_key, scan_host_key};

const SSH_CONNECTION_FAILURE: i32 = 255;
const NAT_HOST: &str = "127.0.0.1";
const NAT_PORT_BASE: std::ops::Range<u16> = 1024..2224;

/// Key files of one node, resolved before any VM starts.
#[derive(Clone, Debug)]
struct NodeKeys {
    private: Utf8PathBuf,
    public: Utf8PathBuf,
}

/// Everything the readiness phase needs about a started VM.
#[derive(Clone, Debug)]
struct StartedNode {
    vm: String,
    user: String,
    key_name: String,
    private_key: Utf8PathBuf,
    public_key: Utf8PathBuf,
    address: Ipv4Addr,
    netmask: Ipv4Addr,
    adapter: String,
    nat_port: u16,
    bootstrap_command: Option<String>,
    root_password: Option<String>,
}

impl<R> HypervisorBackend<R>
where
    R: CommandRunner + Send + Sync,
{
    pub(super) fn vbox(&self, args: &[&str]) -> Result<String, HypervisorError> {
        let program = self.config.hypervisor_bin.as_str();
        let output = self
            .runner
            .run(program, &os_args(args))?
            .into_success(program)?;
        Ok(output.stdout)
    }

    fn vm_names(&self, running_only: bool) -> Result<Vec<String>, HypervisorError> {
        let listing = if running_only { "runningvms" } else { "vms" };
        Ok(parse_vm_list(&self.vbox(&["list", listing])?))
    }

    pub(super) fn active_vms(&self) -> Result<Vec<ActiveNode>, HypervisorError> {
        Ok(self
            .vm_names(true)?
            .into_iter()
            .filter_map(|vm| {
                let (_, cluster_id) = parse_vm_name(&vm, &self.config.vm_suffix)?;
                Some(ActiveNode {
                    cluster_id,
                    identity: vm,
                })
            })
            .collect())
    }

    /// Checks every node and resolves its key pair, so nothing starts for a
    /// request that cannot finish.
    fn validate_request(specs: &NodeSpecs) -> Result<Vec<NodeKeys>, HypervisorError> {
        if specs.len() > MAX_NODES {
            return Err(HypervisorError::TooManyNodes {
                requested: specs.len(),
                max: MAX_NODES,
            });
        }
        let mut keys = Vec::with_capacity(specs.len());
        for (name, spec) in specs {
            if name.is_empty() || name.contains(|c: char| c.is_whitespace() || c == '"') {
                return Err(HypervisorError::InvalidSpec {
                    node: name.clone(),
                    message: String::from("node names must be non-empty without spaces or quotes"),
                });
            }
            spec.validate()
                .map_err(|err| HypervisorError::InvalidSpec {
                    node: name.clone(),
                    message: err.to_string(),
                })?;
            keys.push(resolve_keys(name, spec)?);
        }
        Ok(keys)
    }

    pub(super) async fn start_cluster<'a>(
        &'a self,
        cluster_id: &'a ClusterId,
        specs: &'a NodeSpecs,
    ) -> Result<PendingAllocations<'a, HypervisorError>, HypervisorError> {
        let keys = Self::validate_request(specs)?;
        if specs.is_empty() {
            return Ok(PendingAllocations::new());
        }

        if let Err(err) = self.reap().await {
            warn!(error = %err, "failed to reap before allocating");
        }

        let adapter = self
            .pool
            .acquire_for(cluster_id.as_str())?
            .ok_or_else(|| HypervisorError::NoFreeAdapter {
                pool_dir: self.pool.dir().to_path_buf(),
            })?;
        info!(%cluster_id, adapter = %adapter.name, "acquired host-only adapter");

        if let Err(err) = self.configure_adapter(&adapter) {
            self.pool.release(&[adapter])?;
            return Err(err);
        }

        let base_port = rand::thread_rng().gen_range(NAT_PORT_BASE);
        let mut pending = PendingAllocations::new();
        for (index, ((name, spec), keys)) in specs.iter().zip(keys).enumerate() {
            let address = adapter
                .host_address(index)
                .ok_or(HypervisorError::TooManyNodes {
                    requested: specs.len(),
                    max: MAX_NODES,
                })?;
            let offset = u16::try_from(index + 1).map_err(|_| HypervisorError::TooManyNodes {
                requested: specs.len(),
                max: MAX_NODES,
            })?;
            let target = NodeTarget {
                address,
                nat_port: base_port + offset,
                keys,
            };
            let started = self.start_node(cluster_id, name, spec, &adapter, target)?;
            pending.insert(name.clone(), PendingAllocation::new(self.finish_node(started)));
        }
        Ok(pending)
    }

    fn configure_adapter(&self, adapter: &HostAdapter) -> Result<(), HypervisorError> {
        let gateway = adapter.gateway().to_string();
        let netmask = adapter.netmask.to_string();
        self.vbox(&[
            "hostonlyif",
            "ipconfig",
            &adapter.name,
            "--ip",
            &gateway,
            "--netmask",
            &netmask,
        ])?;
        Ok(())
    }

    fn start_node(
        &self,
        cluster_id: &ClusterId,
        name: &str,
        spec: &NodeSpec,
        adapter: &HostAdapter,
        target: NodeTarget,
    ) -> Result<StartedNode, HypervisorError> {
        let NodeTarget {
            address,
            nat_port,
            keys,
        } = target;
        let vm = vm_name(name, cluster_id, &self.config.vm_suffix);
        let port_forward = format!("guestssh,tcp,,{nat_port},,22");

        self.vbox(&[
            "clonevm",
            &self.config.template,
            "--snapshot",
            &self.config.template_snapshot,
            "--options",
            "link",
            "--name",
            &vm,
            "--register",
        ])?;
        self.vbox(&[
            "modifyvm",
            &vm,
            "--nic1",
            "nat",
            "--nictype1",
            "virtio",
            "--natpf1",
            &port_forward,
            "--nic2",
            "hostonly",
            "--nictype2",
            "virtio",
            "--hostonlyadapter2",
            &adapter.name,
        ])?;
        self.vbox(&["startvm", &vm, "--type", "headless"])?;
        info!(node = name, %vm, %address, nat_port, "started VM");

        Ok(StartedNode {
            vm,
            user: spec
                .username
                .clone()
                .unwrap_or_else(|| self.config.default_user.clone()),
            key_name: spec.ssh_key_name.clone(),
            private_key: keys.private,
            public_key: keys.public,
            address,
            netmask: adapter.netmask,
            adapter: adapter.name.clone(),
            nat_port,
            bootstrap_command: spec.bootstrap_command.clone(),
            root_password: spec.root_password.clone(),
        })
    }

    async fn finish_node(&self, node: StartedNode) -> Result<NodeResult, HypervisorError> {
        self.wait_for_nat_ssh(&node).await?;

        let public_key = read_public_key(&node.public_key)?;
        let script = provision_script(
            node.address,
            node.netmask,
            &public_key,
            node.root_password.as_deref(),
        );
        self.nat_ssh(&node, &self.template_key, &script)?;
        debug!(vm = %node.vm, "configured host-only interface and keys");

        if let Some(command) = &node.bootstrap_command {
            self.nat_ssh(&node, &node.private_key, command)?;
            debug!(vm = %node.vm, "bootstrap command finished");
        }

        let address = node.address.to_string();
        let public_host_key = scan_host_key(&self.runner, &self.config.ssh_keyscan_bin, &address)?;

        let mut extensions = Map::new();
        extensions.insert(
            String::from("system_identity"),
            Value::from(self.config.template.clone()),
        );
        extensions.insert(
            String::from("hypervisor"),
            json!({ "adapter": node.adapter, "ssh_nat_port": node.nat_port }),
        );

        Ok(NodeResult {
            identity: node.vm,
            public_ip_address: address,
            ssh: SshDetails {
                user: node.user,
                private_key_name: node.key_name,
                public_host_key,
            },
            extensions,
        })
    }

    async fn wait_for_nat_ssh(&self, node: &StartedNode) -> Result<(), HypervisorError> {
        let started = Instant::now();
        loop {
            let argv = self.nat_ssh_args(node, &self.template_key, "pwd");
            let output = self.runner.run(&self.config.ssh_bin, &argv)?;
            match output.code {
                Some(0) => return Ok(()),
                Some(SSH_CONNECTION_FAILURE) => {
                    if started.elapsed() >= self.ready_timeout {
                        return Err(HypervisorError::NotReady {
                            vm: node.vm.clone(),
                            timeout_secs: self.ready_timeout.as_secs(),
                        });
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                status => {
                    return Err(HypervisorError::UnexpectedSsh {
                        vm: node.vm.clone(),
                        status,
                        stderr: output.stderr.trim().to_owned(),
                    });
                }
            }
        }
    }

    fn nat_ssh(&self, node: &StartedNode, key: &Utf8Path, command: &str) -> Result<(), CommandError> {
        let argv = self.nat_ssh_args(node, key, command);
        self.runner
            .run(&self.config.ssh_bin, &argv)?
            .into_success(&self.config.ssh_bin)?;
        Ok(())
    }

    fn nat_ssh_args(&self, node: &StartedNode, key: &Utf8Path, command: &str) -> Vec<OsString> {
        let port = node.nat_port.to_string();
        let target = format!("{}@{NAT_HOST}", node.user);
        os_args(&[
            "-i",
            key.as_str(),
            "-p",
            port.as_str(),
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "PasswordAuthentication=no",
            "-o",
            "IdentitiesOnly=yes",
            "-o",
            "ConnectTimeout=5",
            "-o",
            "LogLevel=ERROR",
            target.as_str(),
            command,
        ])
    }

    pub(super) async fn destroy(&self, cluster_id: &ClusterId) -> Result<(), HypervisorError> {
        let mut failures = Vec::new();
        let mut powered_off = 0_usize;
        for node in self.active_vms()? {
            if &node.cluster_id != cluster_id {
                continue;
            }
            match self.vbox(&["controlvm", &node.identity, "poweroff"]) {
                Ok(_) => {
                    powered_off += 1;
                    info!(vm = %node.identity, "powered off VM");
                }
                Err(err) => failures.push(format!("{}: {err}", node.identity)),
            }
        }

        let ended = self.pool.end_leases(cluster_id.as_str())?;
        debug!(%cluster_id, ended, "ended adapter leases");

        if powered_off > 0 {
            tokio::time::sleep(self.poll_interval).await;
        }
        if let Err(err) = self.reap().await {
            warn!(%cluster_id, error = %err, "failed to reap after destroying cluster");
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(HypervisorError::Destruction {
                cluster_id: cluster_id.to_string(),
                failures,
            })
        }
    }

    /// Deletes stopped VMs carrying the configured suffix, then returns
    /// adapters no registered VM holds to the pool.
    ///
    /// Stopped VMs of a cluster whose adapter lease is still live are kept,
    /// since that cluster may still be starting. A VM that cannot be deleted
    /// is logged, reported in [`ReapSummary::failures`] and keeps its
    /// adapter.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError`] when listing VMs, reading the pool, or
    /// reconciling fails.
    pub async fn reap(&self) -> Result<ReapSummary<HostAdapter>, HypervisorError> {
        let suffix = self.config.vm_suffix.as_str();
        let all = self.vm_names(false)?;
        let running: BTreeSet<String> = self.vm_names(true)?.into_iter().collect();
        let starting: BTreeSet<String> = self
            .pool
            .live_leases()?
            .into_iter()
            .filter_map(|lease| lease.holder)
            .collect();

        let mut retained = Vec::new();
        let mut failures = Vec::new();
        for vm in all
            .iter()
            .filter(|vm| vm.ends_with(suffix) && !running.contains(*vm))
        {
            let cluster_id = parse_vm_name(vm, suffix)
                .map_or_else(|| ClusterId::from(""), |(_, cluster_id)| cluster_id);
            let node = ActiveNode {
                cluster_id,
                identity: vm.clone(),
            };
            if starting.contains(node.cluster_id.as_str()) {
                debug!(%vm, "keeping stopped VM of a cluster holding a lease");
                retained.push(node);
                continue;
            }
            match self.vbox(&["unregistervm", vm, "--delete"]) {
                Ok(_) => info!(%vm, "deleted stopped VM"),
                Err(err) => {
                    warn!(%vm, error = %err, "failed to delete stopped VM");
                    failures.push(format!("{vm}: {err}"));
                    retained.push(node);
                }
            }
        }

        let mut summary = reconcile_retaining(self, self, &self.pool, &retained)
            .await
            .map_err(|err| match err {
                ReapError::Backend(source) => source,
                ReapError::Pool(source) => HypervisorError::Pool(source),
            })?;
        summary.failures = failures;
        Ok(summary)
    }
}

/// Where a node lives on the host-only network and how to reach it.
#[derive(Clone, Debug)]
struct NodeTarget {
    address: Ipv4Addr,
    nat_port: u16,
    keys: NodeKeys,
}

fn resolve_keys(name: &str, spec: &NodeSpec) -> Result<NodeKeys, HypervisorError> {
    let lookup = |key: &str| {
        find_ssh_key(key).map_err(|err| HypervisorError::InvalidSpec {
            node: name.to_owned(),
            message: err.to_string(),
        })
    };
    Ok(NodeKeys {
        private: lookup(&spec.ssh_key_name)?,
        public: lookup(&format!("{}.pub", spec.ssh_key_name))?,
    })
}

fn provision_script(
    address: Ipv4Addr,
    netmask: Ipv4Addr,
    public_key: &str,
    root_password: Option<&str>,
) -> String {
    let interfaces = format!(
        "auto eth1\niface eth1 inet static\n      address {address}\n      netmask {netmask}\n"
    );
    let mut root_steps = vec![
        format!(
            "printf '%s' {} > /etc/network/interfaces.d/covey-eth1",
            escape(Cow::from(interfaces))
        ),
        String::from("/sbin/ifup eth1"),
    ];
    if let Some(password) = root_password {
        root_steps.push(format!(
            "printf '%s\\n' {} | chpasswd",
            escape(Cow::from(format!("root:{password}")))
        ));
    }

    format!(
        "sudo sh -c {} && mkdir -p ~/.ssh && printf '%s\\n' {} > ~/.ssh/authorized_keys",
        escape(Cow::from(root_steps.join(" && "))),
        escape(Cow::from(public_key))
    )
}
