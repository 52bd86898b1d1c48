// TC HTB shaping backend
//
// Upload traffic is shaped by an HTB tree on the interface itself, where a
// `cgroup` filter maps the sending socket's net_cls classid straight to the
// rule leaf. Download traffic is redirected from the interface's ingress
// qdisc to an IFB device and shaped there by an identical tree. Redirected
// packets have no socket yet, so on the IFB one `flower` filter per bound
// local port picks the leaf. Unclassified traffic falls through to the
// default leaf in both directions.
//
// REQUIREMENTS:
// - TC (traffic control) and `ip` commands
// - IFB kernel module (ifb)
// - Cgroup v1 with net_cls controller

use super::linux_tc_utils::{
    CommandRunner, DryRunRunner, Presence, SystemRunner, format_rate, ifb_device_name,
    is_already_exists, render_command, run_checked, run_tolerating_missing,
};
use super::{Mutation, Operation, Outcome, ShapingBackend};
use crate::backends::cgroup::{Membership, NetClsGroups};
use crate::cmd_args;
use crate::config::Direction;
use crate::error::BackendError;
use crate::plan::{
    ClassId, ClassNode, ObjectKey, ObjectSet, PortFilter, ProcessBinding, ShapingObject,
};
use crate::process::{LocalPort, Transport};
use procfs::process::Process;
use std::collections::{BTreeMap, BTreeSet};

/// Port filters on the IFB's HTB root, one filter priority per address family
const PORT_FILTER_PRIORITIES: [(&str, &str); 2] = [("ip", "2"), ("ipv6", "3")];

/// Looks up the start time of a live pid
pub type StartTimeLookup = fn(i32) -> Option<u64>;

fn process_start_time(pid: i32) -> Option<u64> {
    Process::new(pid).ok()?.stat().ok().map(|stat| stat.starttime)
}

/// `flower` handle of a port filter, unique within its filter priority
fn port_filter_handle(port: LocalPort) -> u32 {
    match port.transport {
        Transport::Tcp => u32::from(port.port),
        Transport::Udp => 0x1_0000 | u32::from(port.port),
    }
}

/// HTB + IFB + net_cls implementation of [`ShapingBackend`]
pub struct TcHtbBackend<R: CommandRunner = SystemRunner> {
    interface: String,
    ifb_device: String,
    runner: R,
    groups: NetClsGroups,
    /// Log cgroup changes instead of performing them
    dry_run: bool,
    start_time_of: StartTimeLookup,
}

impl TcHtbBackend<SystemRunner> {
    pub fn new(interface: &str, ifb_device: Option<String>) -> Self {
        Self::with_runner(interface, ifb_device, SystemRunner, NetClsGroups::new(interface))
    }
}

impl TcHtbBackend<DryRunRunner> {
    /// Log every command and cgroup change without touching the system
    pub fn dry_run(interface: &str, ifb_device: Option<String>) -> Self {
        let mut backend =
            Self::with_runner(interface, ifb_device, DryRunRunner, NetClsGroups::new(interface));
        backend.dry_run = true;
        backend
    }
}

impl<R: CommandRunner> TcHtbBackend<R> {
    pub fn with_runner(
        interface: &str,
        ifb_device: Option<String>,
        runner: R,
        groups: NetClsGroups,
    ) -> Self {
        Self {
            interface: interface.to_string(),
            ifb_device: ifb_device.unwrap_or_else(|| ifb_device_name(interface)),
            runner,
            groups,
            dry_run: false,
            start_time_of: process_start_time,
        }
    }

    fn device(&self, direction: Direction) -> String {
        match direction {
            Direction::Upload => self.interface.clone(),
            Direction::Download => self.ifb_device.clone(),
        }
    }

    fn tc(&mut self, args: Vec<String>) -> Result<(), BackendError> {
        run_checked(&mut self.runner, "tc", &args)
    }

    fn cgroup<T>(&self, result: anyhow::Result<T>) -> Result<T, BackendError> {
        result.map_err(BackendError::Cgroup)
    }

    /// Delete a qdisc if present; `kind` is `root` or `ingress`
    fn remove_qdisc(&mut self, device: &str, kind: &str) -> Result<Presence, BackendError> {
        run_tolerating_missing(&mut self.runner, "tc", &cmd_args!["qdisc", "del", "dev", device, kind])
    }

    /// Create the IFB device and bring it up
    fn setup_ifb(&mut self) -> Result<(), BackendError> {
        let ifb = self.ifb_device.clone();

        log::debug!("Loading IFB kernel module...");
        let modprobe = self.runner.run("modprobe", &cmd_args!["ifb", "numifbs=0"])?;
        if !modprobe.success {
            log::warn!("Failed to load IFB module (may be built in): {}", modprobe.stderr);
        }

        let add_args = cmd_args!["link", "add", ifb, "type", "ifb"];
        let output = self.runner.run("ip", &add_args)?;
        if output.success {
            log::info!("✅ Created IFB device {}", ifb);
        } else if is_already_exists(&output.stderr) {
            log::debug!("IFB device {} already exists", ifb);
        } else {
            return Err(BackendError::CommandFailed {
                command: render_command("ip", &add_args),
                stderr: output.stderr,
            });
        }

        run_checked(&mut self.runner, "ip", &cmd_args!["link", "set", "dev", ifb, "up"])
    }

    /// Redirect the interface's ingress to the IFB, replacing any earlier
    /// ingress qdisc together with its filters
    fn redirect_ingress(&mut self) -> Result<(), BackendError> {
        let ifb = self.ifb_device.clone();
        let interface = self.interface.clone();

        self.remove_qdisc(&interface, "ingress")?;
        self.tc(cmd_args!["qdisc", "add", "dev", interface, "handle", "ffff:", "ingress"])?;
        for protocol in ["ip", "ipv6"] {
            self.tc(cmd_args![
                "filter", "add", "dev", interface, "parent", "ffff:", "protocol", protocol,
                "u32", "match", "u32", "0", "0", "action", "mirred", "egress", "redirect",
                "dev", ifb,
            ])?;
        }

        log::info!("✅ Redirecting ingress of {} to {}", interface, ifb);
        Ok(())
    }

    /// Install the HTB root. Starts from a bare device every time, so an
    /// attempt that failed halfway can simply be repeated.
    fn create_root(&mut self, node: &ClassNode) -> Result<Outcome, BackendError> {
        let direction = node.key.direction();
        let device = self.device(direction);

        if direction == Direction::Download {
            self.setup_ifb()?;
        }
        if self.remove_qdisc(&device, "root")? == Presence::Done {
            log::debug!("Replaced leftover root qdisc on {}", device);
        }
        if direction == Direction::Download {
            self.redirect_ingress()?;
        }

        let default_class = ClassId::default_leaf();
        self.tc(cmd_args![
            "qdisc", "add", "dev", device, "root", "handle", ClassId::qdisc(), "htb",
            "default", format!("{:x}", default_class.minor),
        ])?;

        if direction == Direction::Upload {
            for (protocol, handle) in [("ip", "1:"), ("ipv6", "2:")] {
                self.tc(cmd_args![
                    "filter", "add", "dev", device, "parent", ClassId::qdisc(), "protocol",
                    protocol, "prio", "1", "handle", handle, "cgroup",
                ])?;
            }
        }

        self.create_class(node)?;
        log::info!("✅ HTB hierarchy for {} traffic installed on {}", direction, device);
        Ok(Outcome::Applied)
    }

    fn delete_root(&mut self, node: &ClassNode) -> Result<Outcome, BackendError> {
        let direction = node.key.direction();
        let device = self.device(direction);

        let presence = self.remove_qdisc(&device, "root")?;

        match direction {
            Direction::Download => {
                let interface = self.interface.clone();
                self.remove_qdisc(&interface, "ingress")?;
                run_tolerating_missing(
                    &mut self.runner,
                    "ip",
                    &cmd_args!["link", "del", self.ifb_device.clone()],
                )?;
            }
            // The upload tree is the only user of the net_cls groups
            Direction::Upload if !self.dry_run => {
                self.cgroup(self.groups.clear_namespace())?;
            }
            Direction::Upload => {}
        }

        Ok(match presence {
            Presence::Done => Outcome::Applied,
            Presence::Missing => Outcome::NotFound,
        })
    }

    fn class_args(&self, verb: &str, node: &ClassNode) -> Vec<String> {
        let device = self.device(node.key.direction());
        cmd_args![
            "class", verb, "dev", device, "parent", node.parent_class, "classid",
            node.class_id, "htb", "rate", format_rate(Some(node.guarantee)), "ceil",
            format_rate(node.ceiling), "prio", node.priority,
        ]
    }

    fn create_class(&mut self, node: &ClassNode) -> Result<(), BackendError> {
        let args = self.class_args("add", node);
        let output = self.runner.run("tc", &args)?;
        if output.success {
            return Ok(());
        }
        if is_already_exists(&output.stderr) {
            log::debug!("Class {} already exists, updating it instead", node.class_id);
            return self.tc(self.class_args("change", node));
        }
        Err(BackendError::CommandFailed {
            command: render_command("tc", &args),
            stderr: output.stderr,
        })
    }

    fn delete_class(&mut self, node: &ClassNode) -> Result<Outcome, BackendError> {
        let device = self.device(node.key.direction());
        let presence = run_tolerating_missing(
            &mut self.runner,
            "tc",
            &cmd_args!["class", "del", "dev", device, "classid", node.class_id],
        )?;
        Ok(match presence {
            Presence::Done => Outcome::Applied,
            Presence::Missing => Outcome::NotFound,
        })
    }

    fn apply_class(&mut self, operation: Operation, node: &ClassNode) -> Result<Outcome, BackendError> {
        let has_group =
            matches!(node.key, ObjectKey::Leaf(Direction::Upload, _)) && !self.dry_run;
        match (operation, &node.key) {
            (Operation::Create, ObjectKey::Root(_)) => self.create_root(node),
            (Operation::Delete, ObjectKey::Root(_)) => self.delete_root(node),
            (Operation::Create, _) => {
                self.create_class(node)?;
                if has_group {
                    self.cgroup(self.groups.ensure_group(node.class_id))?;
                }
                Ok(Outcome::Applied)
            }
            (Operation::Update, _) => {
                self.tc(self.class_args("change", node))?;
                Ok(Outcome::Applied)
            }
            (Operation::Delete, _) => {
                let outcome = self.delete_class(node)?;
                if has_group {
                    self.cgroup(self.groups.release_group(node.class_id))?;
                }
                Ok(outcome)
            }
        }
    }

    /// Point inbound traffic for the filter's port at its rule leaf
    fn install_port_filter(&mut self, filter: &PortFilter) -> Result<Outcome, BackendError> {
        let ifb = self.ifb_device.clone();
        let handle = port_filter_handle(filter.port);
        for (protocol, prio) in PORT_FILTER_PRIORITIES {
            // replace creates the filter, or repoints it when the port
            // changed owner
            self.tc(cmd_args![
                "filter", "replace", "dev", ifb, "parent", ClassId::qdisc(), "protocol",
                protocol, "prio", prio, "handle", handle, "flower", "ip_proto",
                filter.port.transport, "dst_port", filter.port.port, "classid", filter.class_id,
            ])?;
        }
        log::debug!("Inbound {} now shaped by rule {:?}", filter.port, filter.rule);
        Ok(Outcome::Applied)
    }

    fn remove_port_filter(&mut self, filter: &PortFilter) -> Result<Outcome, BackendError> {
        let ifb = self.ifb_device.clone();
        let handle = port_filter_handle(filter.port);
        let mut outcome = Outcome::NotFound;
        for (protocol, prio) in PORT_FILTER_PRIORITIES {
            let presence = run_tolerating_missing(
                &mut self.runner,
                "tc",
                &cmd_args![
                    "filter", "del", "dev", ifb, "parent", ClassId::qdisc(), "protocol",
                    protocol, "prio", prio, "handle", handle, "flower",
                ],
            )?;
            if presence == Presence::Done {
                outcome = Outcome::Applied;
            }
        }
        Ok(outcome)
    }

    /// Whether `binding` still refers to the same process incarnation
    fn is_same_process(&self, binding: &ProcessBinding) -> bool {
        (self.start_time_of)(binding.process.pid) == Some(binding.process.start_time)
    }

    fn bind_process(&mut self, binding: &ProcessBinding) -> Result<Outcome, BackendError> {
        let pid = binding.process.pid;
        if self.dry_run {
            log::info!("[dry-run] move PID {} into cgroup of {}", pid, binding.class_id);
            return Ok(Outcome::Applied);
        }
        if !self.is_same_process(binding) {
            return Ok(Outcome::NotFound);
        }

        match self.cgroup(self.groups.attach(binding.class_id, pid))? {
            Membership::Moved => {
                log::debug!("PID {} now shaped by rule {:?}", pid, binding.rule);
                Ok(Outcome::Applied)
            }
            Membership::Vanished => Ok(Outcome::NotFound),
        }
    }

    fn unbind_process(&mut self, binding: &ProcessBinding) -> Result<Outcome, BackendError> {
        let pid = binding.process.pid;
        if self.dry_run {
            log::info!("[dry-run] move PID {} back to the root cgroup", pid);
            return Ok(Outcome::Applied);
        }
        // A recycled pid or a process already claimed by another rule must
        // not be moved
        if !self.is_same_process(binding) {
            return Ok(Outcome::NotFound);
        }
        if !self.cgroup(self.groups.contains(binding.class_id, pid))? {
            return Ok(Outcome::NotFound);
        }

        match self.cgroup(self.groups.detach(pid))? {
            Membership::Moved => Ok(Outcome::Applied),
            Membership::Vanished => Ok(Outcome::NotFound),
        }
    }
}

impl<R: CommandRunner> ShapingBackend for TcHtbBackend<R> {
    fn name(&self) -> &'static str {
        "tc_htb"
    }

    fn clear_stale(&mut self) -> Result<(), BackendError> {
        log::debug!("Clearing stale shaping state on {}", self.interface);
        let interface = self.interface.clone();
        let ifb = self.ifb_device.clone();

        for (device, kind) in [(&interface, "root"), (&interface, "ingress"), (&ifb, "root")] {
            if self.remove_qdisc(device, kind)? == Presence::Done {
                log::info!("Removed stale {} qdisc from {}", kind, device);
            }
        }

        if !self.dry_run {
            let cleared = self.cgroup(self.groups.clear_namespace())?;
            if cleared > 0 {
                log::info!("Released {} stale cgroup(s) in {:?}", cleared, self.groups.namespace());
            }
        }
        Ok(())
    }

    fn apply(&mut self, mutation: &Mutation) -> Result<Outcome, BackendError> {
        log::trace!("Applying {}", mutation);
        match (&mutation.object, mutation.operation) {
            (ShapingObject::Class(node), operation) => self.apply_class(operation, node),
            (ShapingObject::Binding(binding), Operation::Create) => self.bind_process(binding),
            (ShapingObject::Binding(binding), Operation::Delete) => self.unbind_process(binding),
            // A binding has no attributes to change
            (ShapingObject::Binding(_), Operation::Update) => Ok(Outcome::Applied),
            (ShapingObject::PortFilter(filter), Operation::Create | Operation::Update) => {
                self.install_port_filter(filter)
            }
            (ShapingObject::PortFilter(filter), Operation::Delete) => {
                self.remove_port_filter(filter)
            }
        }
    }

    /// Move processes that joined a rule's cgroup by forking, without being
    /// bound themselves, back to the root group
    fn sweep(&mut self, realized: &ObjectSet) -> Result<usize, BackendError> {
        if self.dry_run {
            return Ok(0);
        }

        let mut owned: BTreeMap<ClassId, BTreeSet<i32>> = BTreeMap::new();
        for object in realized.values() {
            match object {
                ShapingObject::Class(node)
                    if matches!(node.key, ObjectKey::Leaf(Direction::Upload, _)) =>
                {
                    owned.entry(node.class_id).or_default();
                }
                ShapingObject::Binding(binding) => {
                    owned
                        .entry(binding.class_id)
                        .or_default()
                        .insert(binding.process.pid);
                }
                _ => {}
            }
        }

        let mut released = 0;
        for (class_id, pids) in owned {
            for pid in self.cgroup(self.groups.members(class_id))? {
                if pids.contains(&pid) {
                    continue;
                }
                if self.cgroup(self.groups.detach(pid))? == Membership::Moved {
                    log::debug!("PID {} inherited the cgroup of {}, releasing it", pid, class_id);
                    released += 1;
                }
            }
        }

        if released > 0 {
            log::info!("Released {} process(es) no rule owns from rule cgroups", released);
        }
        Ok(released)
    }
}

#[cfg(test)]
impl<R: CommandRunner> TcHtbBackend<R> {
    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn ifb_device(&self) -> &str {
        &self.ifb_device
    }

    /// Replace the procfs start time lookup
    pub fn with_start_time_lookup(mut self, lookup: StartTimeLookup) -> Self {
        self.start_time_of = lookup;
        self
    }
}
