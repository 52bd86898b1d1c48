use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

/// Identifies one process incarnation: pids are recycled, start times are not
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessIdentifier {
    pub pid: i32,
    /// Start time in clock ticks since boot
    pub start_time: u64,
}

impl ProcessIdentifier {
    pub fn new(pid: i32, start_time: u64) -> Self {
        Self { pid, start_time }
    }
}

impl fmt::Display for ProcessIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pid, self.start_time)
    }
}

/// Transport protocol of a local socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A local port one of a process's sockets is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalPort {
    pub transport: Transport,
    pub port: u16,
}

impl LocalPort {
    pub fn new(transport: Transport, port: u16) -> Self {
        Self { transport, port }
    }

    pub fn tcp(port: u16) -> Self {
        Self::new(Transport::Tcp, port)
    }

    pub fn udp(port: u16) -> Self {
        Self::new(Transport::Udp, port)
    }
}

impl fmt::Display for LocalPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.transport, self.port)
    }
}

/// Process attributes a match predicate can reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProcessAttribute {
    Name,
    Exe,
    Cmdline,
    Cwd,
    Username,
    Uid,
    Pid,
    Ppid,
    Status,
    Nice,
    NumThreads,
    StartTime,
}

impl ProcessAttribute {
    pub const ALL: [ProcessAttribute; 12] = [
        ProcessAttribute::Name,
        ProcessAttribute::Exe,
        ProcessAttribute::Cmdline,
        ProcessAttribute::Cwd,
        ProcessAttribute::Username,
        ProcessAttribute::Uid,
        ProcessAttribute::Pid,
        ProcessAttribute::Ppid,
        ProcessAttribute::Status,
        ProcessAttribute::Nice,
        ProcessAttribute::NumThreads,
        ProcessAttribute::StartTime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessAttribute::Name => "name",
            ProcessAttribute::Exe => "exe",
            ProcessAttribute::Cmdline => "cmdline",
            ProcessAttribute::Cwd => "cwd",
            ProcessAttribute::Username => "username",
            ProcessAttribute::Uid => "uid",
            ProcessAttribute::Pid => "pid",
            ProcessAttribute::Ppid => "ppid",
            ProcessAttribute::Status => "status",
            ProcessAttribute::Nice => "nice",
            ProcessAttribute::NumThreads => "num_threads",
            ProcessAttribute::StartTime => "start_time",
        }
    }
}

impl fmt::Display for ProcessAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessAttribute {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "create_time" => Ok(ProcessAttribute::StartTime),
            "uids" => Ok(ProcessAttribute::Uid),
            other => ProcessAttribute::ALL
                .into_iter()
                .find(|attribute| attribute.as_str() == other)
                .ok_or(()),
        }
    }
}

/// Value of one process attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Text(String),
    List(Vec<String>),
    Integer(i64),
}

impl AttributeValue {
    /// The string predicates are matched against: lists are joined with
    /// spaces and integers are rendered in decimal
    pub fn normalized(&self) -> Cow<'_, str> {
        match self {
            AttributeValue::Text(text) => Cow::Borrowed(text),
            AttributeValue::List(items) => Cow::Owned(items.join(" ")),
            AttributeValue::Integer(value) => Cow::Owned(value.to_string()),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(value: Vec<String>) -> Self {
        AttributeValue::List(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Integer(value)
    }
}

/// Point-in-time metadata for a single process
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessRecord {
    pub id: ProcessIdentifier,
    pub ppid: i32,
    attributes: BTreeMap<ProcessAttribute, AttributeValue>,
    /// Local ports of the process's open sockets
    ports: BTreeSet<LocalPort>,
}

impl ProcessRecord {
    pub fn new(pid: i32, ppid: i32, start_time: u64) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(ProcessAttribute::Pid, AttributeValue::Integer(pid.into()));
        attributes.insert(ProcessAttribute::Ppid, AttributeValue::Integer(ppid.into()));
        attributes.insert(
            ProcessAttribute::StartTime,
            AttributeValue::Integer(i64::try_from(start_time).unwrap_or(i64::MAX)),
        );

        Self {
            id: ProcessIdentifier::new(pid, start_time),
            ppid,
            attributes,
            ports: BTreeSet::new(),
        }
    }

    pub fn with(mut self, attribute: ProcessAttribute, value: impl Into<AttributeValue>) -> Self {
        self.set(attribute, value);
        self
    }

    pub fn set(&mut self, attribute: ProcessAttribute, value: impl Into<AttributeValue>) {
        self.attributes.insert(attribute, value.into());
    }

    pub fn attribute(&self, attribute: ProcessAttribute) -> Option<&AttributeValue> {
        self.attributes.get(&attribute)
    }

    pub fn with_port(mut self, port: LocalPort) -> Self {
        self.add_port(port);
        self
    }

    pub fn add_port(&mut self, port: LocalPort) {
        self.ports.insert(port);
    }

    pub fn ports(&self) -> &BTreeSet<LocalPort> {
        &self.ports
    }

    pub fn pid(&self) -> i32 {
        self.id.pid
    }

    /// Best-effort display name for log messages
    pub fn display_name(&self) -> Cow<'_, str> {
        match self.attribute(ProcessAttribute::Name) {
            Some(value) => value.normalized(),
            None => Cow::Owned(format!("PID {}", self.pid())),
        }
    }
}

/// All processes visible at one instant, keyed by pid
#[derive(Debug, Clone, Default)]
pub struct ProcessSnapshot {
    processes: BTreeMap<i32, ProcessRecord>,
}

impl ProcessSnapshot {
    pub fn new(records: impl IntoIterator<Item = ProcessRecord>) -> Self {
        records.into_iter().collect()
    }

    pub fn get(&self, pid: i32) -> Option<&ProcessRecord> {
        self.processes.get(&pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.processes.values()
    }

    /// Every transitive descendant of `roots`, roots excluded unless one
    /// descends from another
    pub fn descendants_of(&self, roots: impl IntoIterator<Item = i32>) -> BTreeSet<i32> {
        let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
        for record in self.processes.values() {
            if record.ppid != record.pid() {
                children.entry(record.ppid).or_default().push(record.pid());
            }
        }

        let mut found = BTreeSet::new();
        let mut queue: VecDeque<i32> = roots.into_iter().collect();
        while let Some(pid) = queue.pop_front() {
            for &child in children.get(&pid).map(Vec::as_slice).unwrap_or_default() {
                if found.insert(child) {
                    queue.push_back(child);
                }
            }
        }

        found
    }
}

impl FromIterator<ProcessRecord> for ProcessSnapshot {
    fn from_iter<T: IntoIterator<Item = ProcessRecord>>(iter: T) -> Self {
        Self {
            processes: iter.into_iter().map(|record| (record.pid(), record)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_names_round_trip() {
        for attribute in ProcessAttribute::ALL {
            assert_eq!(attribute.as_str().parse::<ProcessAttribute>(), Ok(attribute));
        }
        assert_eq!("create_time".parse::<ProcessAttribute>(), Ok(ProcessAttribute::StartTime));
        assert_eq!("num-threads".parse::<ProcessAttribute>(), Ok(ProcessAttribute::NumThreads));
        assert!("connections".parse::<ProcessAttribute>().is_err());
    }

    #[test]
    fn test_normalization() {
        let list = AttributeValue::from(vec!["firefox".to_string(), "--private".to_string()]);
        assert_eq!(list.normalized(), "firefox --private");
        assert_eq!(AttributeValue::from(-5).normalized(), "-5");
        assert_eq!(AttributeValue::from("bash").normalized(), "bash");
    }

    #[test]
    fn test_record_carries_numeric_identity() {
        let record = ProcessRecord::new(42, 1, 9000);
        assert_eq!(
            record.attribute(ProcessAttribute::Pid),
            Some(&AttributeValue::Integer(42))
        );
        assert_eq!(
            record.attribute(ProcessAttribute::Ppid),
            Some(&AttributeValue::Integer(1))
        );
        assert_eq!(record.id.to_string(), "42@9000");
        assert_eq!(record.display_name(), "PID 42");
    }

    #[test]
    fn test_ports_are_deduplicated_and_ordered() {
        let record = ProcessRecord::new(7, 1, 70)
            .with_port(LocalPort::udp(53))
            .with_port(LocalPort::tcp(443))
            .with_port(LocalPort::tcp(443));

        let ports: Vec<String> = record.ports().iter().map(LocalPort::to_string).collect();
        assert_eq!(ports, ["tcp/443", "udp/53"]);
    }

    #[test]
    fn test_descendants_are_transitive() {
        let snapshot = ProcessSnapshot::new([
            ProcessRecord::new(1, 0, 1),
            ProcessRecord::new(10, 1, 2),
            ProcessRecord::new(11, 10, 3),
            ProcessRecord::new(12, 11, 4),
            ProcessRecord::new(20, 1, 5),
        ]);

        let descendants = snapshot.descendants_of([10]);
        assert_eq!(descendants, BTreeSet::from([11, 12]));
        assert!(snapshot.descendants_of([12]).is_empty());
    }

    #[test]
    fn test_descendants_survive_parent_cycles() {
        // A torn read of /proc can momentarily report nonsense parentage
        let snapshot = ProcessSnapshot::new([
            ProcessRecord::new(5, 6, 1),
            ProcessRecord::new(6, 5, 2),
        ]);
        assert_eq!(snapshot.descendants_of([5]), BTreeSet::from([5, 6]));
    }
}
