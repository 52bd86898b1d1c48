//! Class hierarchy derived from the configuration
//!
//! Per direction the hierarchy is
//!
//! ```text
//! root (global rate)
//!  ├─ band 0 (sum of member minimums)
//!  │   ├─ rule leaf ...
//!  │   └─ default leaf (leftover traffic, when it lands in band 0)
//!  └─ band 1
//!      └─ rule leaf ...
//! ```
//!
//! Outbound traffic of a bound process is classified through its net_cls
//! cgroup, so upload leaves get one binding per process. Inbound packets
//! carry no socket yet, so download leaves get one port filter per local
//! port of the bound processes instead.
//!
//! Everything here is pure: the same configuration always yields the same
//! plan, keys and class ids included.

use crate::config::{Direction, GlobalConfig};
use crate::matcher::LiveBinding;
use crate::priority::{Band, ResolvedBands};
use crate::process::{LocalPort, ProcessIdentifier};
use crate::rate::{Rate, describe_ceiling};
use std::collections::BTreeMap;
use std::fmt;

pub const HTB_MAJOR: u16 = 1;
const ROOT_MINOR: u16 = 0x1;
const DEFAULT_MINOR: u16 = 0x2;
const BAND_MINOR_BASE: u16 = 0x10;
const LEAF_MINOR_BASE: u16 = 0x1000;
/// HTB accepts `prio` 0 through 7
const MAX_HTB_PRIO: Band = 7;

/// A `major:minor` traffic control handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassId {
    pub major: u16,
    pub minor: u16,
}

impl ClassId {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// The qdisc handle `1:` the class tree hangs from
    pub const fn qdisc() -> Self {
        Self::new(HTB_MAJOR, 0)
    }

    pub const fn root() -> Self {
        Self::new(HTB_MAJOR, ROOT_MINOR)
    }

    pub const fn default_leaf() -> Self {
        Self::new(HTB_MAJOR, DEFAULT_MINOR)
    }

    /// Value written to `net_cls.classid`: 0xAAAABBBB for AAAA:BBBB
    pub fn net_cls_value(&self) -> u32 {
        (u32::from(self.major) << 16) | u32::from(self.minor)
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.minor == 0 {
            write!(f, "{:x}:", self.major)
        } else {
            write!(f, "{:x}:{:x}", self.major, self.minor)
        }
    }
}

/// Stable identity of a shaping object across passes
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKey {
    Root(Direction),
    Band(Direction, Band),
    Default(Direction),
    Leaf(Direction, String),
    Binding(Direction, String, ProcessIdentifier),
    /// Inbound traffic to a local port; at most one rule owns a port
    PortFilter(LocalPort),
}

impl ObjectKey {
    pub fn direction(&self) -> Direction {
        match self {
            ObjectKey::Root(direction)
            | ObjectKey::Band(direction, _)
            | ObjectKey::Default(direction)
            | ObjectKey::Leaf(direction, _)
            | ObjectKey::Binding(direction, _, _) => *direction,
            ObjectKey::PortFilter(_) => Direction::Download,
        }
    }

    /// Distance from the root; children are always one level deeper
    pub fn depth(&self) -> u8 {
        match self {
            ObjectKey::Root(_) => 0,
            ObjectKey::Band(_, _) => 1,
            ObjectKey::Default(_) | ObjectKey::Leaf(_, _) => 2,
            ObjectKey::Binding(_, _, _) | ObjectKey::PortFilter(_) => 3,
        }
    }

    /// Process bindings and port filters, which steer traffic into a leaf
    pub fn is_attachment(&self) -> bool {
        matches!(self, ObjectKey::Binding(_, _, _) | ObjectKey::PortFilter(_))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKey::Root(direction) => write!(f, "{}/root", direction),
            ObjectKey::Band(direction, band) => write!(f, "{}/band {}", direction, band),
            ObjectKey::Default(direction) => write!(f, "{}/default", direction),
            ObjectKey::Leaf(direction, label) => write!(f, "{}/rule {:?}", direction, label),
            ObjectKey::Binding(direction, label, process) => {
                write!(f, "{}/rule {:?}/process {}", direction, label, process)
            }
            ObjectKey::PortFilter(port) => write!(f, "{}/port {}", Direction::Download, port),
        }
    }
}

/// An HTB class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassNode {
    pub key: ObjectKey,
    pub parent: Option<ObjectKey>,
    pub class_id: ClassId,
    pub parent_class: ClassId,
    pub guarantee: Rate,
    /// `None` leaves the class uncapped
    pub ceiling: Option<Rate>,
    /// HTB `prio`, lower is dequeued first when borrowing
    pub priority: u8,
}

/// Attachment of one process to a rule leaf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessBinding {
    pub key: ObjectKey,
    pub leaf: ObjectKey,
    pub rule: String,
    pub class_id: ClassId,
    pub process: ProcessIdentifier,
}

/// Classification of inbound traffic for one local port into a rule leaf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortFilter {
    pub key: ObjectKey,
    pub leaf: ObjectKey,
    pub rule: String,
    pub class_id: ClassId,
    pub port: LocalPort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapingObject {
    Class(ClassNode),
    Binding(ProcessBinding),
    PortFilter(PortFilter),
}

impl ShapingObject {
    pub fn key(&self) -> &ObjectKey {
        match self {
            ShapingObject::Class(node) => &node.key,
            ShapingObject::Binding(binding) => &binding.key,
            ShapingObject::PortFilter(filter) => &filter.key,
        }
    }

    pub fn parent(&self) -> Option<&ObjectKey> {
        match self {
            ShapingObject::Class(node) => node.parent.as_ref(),
            ShapingObject::Binding(binding) => Some(&binding.leaf),
            ShapingObject::PortFilter(filter) => Some(&filter.leaf),
        }
    }

    pub fn depth(&self) -> u8 {
        self.key().depth()
    }
}

/// Shaping objects by key, as desired or as realized
pub type ObjectSet = BTreeMap<ObjectKey, ShapingObject>;

/// The class tree of one direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectionPlan {
    pub direction: Direction,
    pub root: ClassNode,
    pub bands: Vec<ClassNode>,
    pub default_leaf: ClassNode,
    /// Rule leaves in declaration order
    pub leaves: Vec<ClassNode>,
}

impl DirectionPlan {
    pub fn leaf(&self, label: &str) -> Option<&ClassNode> {
        self.leaves
            .iter()
            .find(|node| matches!(&node.key, ObjectKey::Leaf(_, leaf) if leaf == label))
    }

    /// Root, bands and default leaf, parents first
    pub fn skeleton(&self) -> impl Iterator<Item = &ClassNode> {
        std::iter::once(&self.root)
            .chain(self.bands.iter())
            .chain(std::iter::once(&self.default_leaf))
    }
}

/// Both directions' class trees plus anything worth telling the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapingPlan {
    pub interface: String,
    pub download: DirectionPlan,
    pub upload: DirectionPlan,
    warnings: Vec<String>,
}

impl ShapingPlan {
    pub fn direction(&self, direction: Direction) -> &DirectionPlan {
        match direction {
            Direction::Download => &self.download,
            Direction::Upload => &self.upload,
        }
    }

    pub fn leaf(&self, direction: Direction, label: &str) -> Option<&ClassNode> {
        self.direction(direction).leaf(label)
    }

    /// Objects that exist for the whole run regardless of bound processes
    pub fn skeleton_objects(&self) -> Vec<ShapingObject> {
        Direction::ALL
            .into_iter()
            .flat_map(|direction| self.direction(direction).skeleton())
            .cloned()
            .map(ShapingObject::Class)
            .collect()
    }

    /// Everything that should exist given the current process binding:
    /// the skeleton, a leaf for every rule owning a process, one upload
    /// binding per owned process and one download port filter per owned
    /// local port
    pub fn desired_state(&self, binding: &LiveBinding) -> ObjectSet {
        let mut desired: ObjectSet = self
            .skeleton_objects()
            .into_iter()
            .map(|object| (object.key().clone(), object))
            .collect();

        for rule_binding in binding.bound_rules() {
            let label = &rule_binding.label;

            if let Some(leaf) = self.leaf(Direction::Upload, label) {
                desired.insert(leaf.key.clone(), ShapingObject::Class(leaf.clone()));
                for process in &rule_binding.processes {
                    let key = ObjectKey::Binding(Direction::Upload, label.clone(), *process);
                    desired.insert(
                        key.clone(),
                        ShapingObject::Binding(ProcessBinding {
                            key,
                            leaf: leaf.key.clone(),
                            rule: label.clone(),
                            class_id: leaf.class_id,
                            process: *process,
                        }),
                    );
                }
            }

            if let Some(leaf) = self.leaf(Direction::Download, label) {
                desired.insert(leaf.key.clone(), ShapingObject::Class(leaf.clone()));
                for port in &rule_binding.ports {
                    // Rules are visited in declaration order, so a port shared
                    // by processes of several rules stays with the first
                    let key = ObjectKey::PortFilter(*port);
                    desired.entry(key.clone()).or_insert_with(|| {
                        ShapingObject::PortFilter(PortFilter {
                            key,
                            leaf: leaf.key.clone(),
                            rule: label.clone(),
                            class_id: leaf.class_id,
                            port: *port,
                        })
                    });
                }
            }
        }

        desired
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

fn htb_priority(band: Band) -> u8 {
    // Never exceeds MAX_HTB_PRIO, so the narrowing is lossless
    band.min(MAX_HTB_PRIO) as u8
}

fn clamp_to_ceiling(guarantee: Rate, ceiling: Option<Rate>) -> Rate {
    match ceiling {
        Some(ceiling) => guarantee.min(ceiling),
        None => guarantee,
    }
}

fn build_direction(
    config: &GlobalConfig,
    bands: &ResolvedBands,
    direction: Direction,
    warnings: &mut Vec<String>,
) -> DirectionPlan {
    let global = config.limits(direction);
    let global_band = bands.global.get(direction);
    let root_ceiling = global.rate;

    let root = ClassNode {
        key: ObjectKey::Root(direction),
        parent: None,
        class_id: ClassId::root(),
        parent_class: ClassId::qdisc(),
        guarantee: root_ceiling.unwrap_or(Rate::from_bits_per_sec(
            crate::rate::UNCAPPED_BITS_PER_SEC,
        )),
        ceiling: root_ceiling,
        priority: 0,
    };

    let mut band_guarantees: BTreeMap<Band, Rate> = bands
        .bands_in_use(direction)
        .into_iter()
        .map(|band| (band, Rate::ZERO))
        .collect();

    if let Some(sum) = band_guarantees.get_mut(&global_band) {
        *sum = sum.saturating_add(global.minimum);
    }
    for rule in &config.rules {
        let Some(band) = bands.rule(&rule.label).map(|pair| pair.get(direction)) else {
            continue;
        };
        if let Some(sum) = band_guarantees.get_mut(&band) {
            *sum = sum.saturating_add(rule.limits(direction).minimum);
        }
    }

    if let Some(rate) = root_ceiling {
        let total = band_guarantees
            .values()
            .fold(Rate::ZERO, |total, rate| total.saturating_add(*rate));
        if total > rate {
            warnings.push(format!(
                "{} guarantees add up to {} which exceeds the global rate of {}",
                direction, total, rate
            ));
        }
    }

    let band_nodes: Vec<ClassNode> = band_guarantees
        .iter()
        .map(|(&band, &guarantee)| ClassNode {
            key: ObjectKey::Band(direction, band),
            parent: Some(root.key.clone()),
            class_id: ClassId::new(HTB_MAJOR, BAND_MINOR_BASE + band),
            parent_class: root.class_id,
            guarantee: clamp_to_ceiling(guarantee, root_ceiling),
            ceiling: root_ceiling,
            priority: htb_priority(band),
        })
        .collect();

    let band_node = |band: Band| -> (ObjectKey, ClassId) {
        (
            ObjectKey::Band(direction, band),
            ClassId::new(HTB_MAJOR, BAND_MINOR_BASE + band),
        )
    };

    let (default_parent, default_parent_class) = band_node(global_band);
    let default_leaf = ClassNode {
        key: ObjectKey::Default(direction),
        parent: Some(default_parent),
        class_id: ClassId::default_leaf(),
        parent_class: default_parent_class,
        guarantee: clamp_to_ceiling(global.minimum, root_ceiling),
        ceiling: root_ceiling,
        priority: htb_priority(global_band),
    };

    let mut leaves = Vec::with_capacity(config.rules.len());
    for (index, rule) in config.rules.iter().enumerate() {
        let Some(band) = bands.rule(&rule.label).map(|pair| pair.get(direction)) else {
            continue;
        };
        let limits = rule.limits(direction);

        if let (Some(rule_rate), Some(global_rate)) = (limits.rate, root_ceiling) {
            if rule_rate > global_rate {
                warnings.push(format!(
                    "rule {:?}: {} rate of {} exceeds the global rate of {}",
                    rule.label, direction, rule_rate, global_rate
                ));
            }
        }

        let ceiling = limits.rate.or(root_ceiling);
        if let Some(ceiling) = ceiling {
            if limits.minimum > ceiling {
                warnings.push(format!(
                    "rule {:?}: {} minimum of {} is above its ceiling of {}, clamping",
                    rule.label, direction, limits.minimum, ceiling
                ));
            }
        }

        let (parent, parent_class) = band_node(band);
        // Bounded by MAX_RULES, so the minor stays inside the leaf window
        let minor = LEAF_MINOR_BASE + index as u16;
        leaves.push(ClassNode {
            key: ObjectKey::Leaf(direction, rule.label.clone()),
            parent: Some(parent),
            class_id: ClassId::new(HTB_MAJOR, minor),
            parent_class,
            guarantee: clamp_to_ceiling(limits.minimum, ceiling),
            ceiling,
            priority: htb_priority(band),
        });
    }

    log::debug!(
        "{} plan: root ceiling {}, {} band(s), {} rule leaf/leaves",
        direction,
        describe_ceiling(root_ceiling),
        band_nodes.len(),
        leaves.len()
    );

    DirectionPlan {
        direction,
        root,
        bands: band_nodes,
        default_leaf,
        leaves,
    }
}

/// Derive both directions' class trees from the configuration
pub fn build_skeleton(config: &GlobalConfig, bands: &ResolvedBands) -> ShapingPlan {
    let mut warnings = Vec::new();
    let download = build_direction(config, bands, Direction::Download, &mut warnings);
    let upload = build_direction(config, bands, Direction::Upload, &mut warnings);

    ShapingPlan {
        interface: config.interface.clone(),
        download,
        upload,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GLOBAL_MINIMUM_DOWNLOAD_RATE, MINIMUM_DOWNLOAD_RATE};
    use crate::matcher::bind;
    use crate::priority::resolve_bands;
    use crate::process::{ProcessAttribute, ProcessRecord, ProcessSnapshot};

    const GAME_AND_BROWSER: &str = r#"
download: 5000000
processes:
  Game:
    download-priority: 0
    match:
      - name: ^game$
  Browser:
    download: 2500000
    download-priority: 1
    match:
      - name: ^browser$
"#;

    fn plan_for(yaml: &str) -> ShapingPlan {
        let config = GlobalConfig::from_yaml_str("eth0", yaml).unwrap();
        let bands = resolve_bands(&config);
        build_skeleton(&config, &bands)
    }

    #[test]
    fn test_class_id_formatting() {
        assert_eq!(ClassId::qdisc().to_string(), "1:");
        assert_eq!(ClassId::root().to_string(), "1:1");
        assert_eq!(ClassId::new(1, 0x1003).to_string(), "1:1003");
        assert_eq!(ClassId::new(1, 0x1003).net_cls_value(), 0x0001_1003);
    }

    #[test]
    fn test_build_skeleton_is_idempotent() {
        let config = GlobalConfig::from_yaml_str("eth0", GAME_AND_BROWSER).unwrap();
        let bands = resolve_bands(&config);
        assert_eq!(build_skeleton(&config, &bands), build_skeleton(&config, &bands));
    }

    #[test]
    fn test_game_and_browser_download_tree() {
        let plan = plan_for(GAME_AND_BROWSER);
        let download = plan.direction(Direction::Download);

        assert_eq!(download.root.ceiling, Some(Rate::from_bits_per_sec(5_000_000)));
        assert_eq!(download.bands.len(), 3);

        let game = plan.leaf(Direction::Download, "Game").unwrap();
        assert_eq!(game.parent, Some(ObjectKey::Band(Direction::Download, 0)));
        assert_eq!(game.ceiling, Some(Rate::from_bits_per_sec(5_000_000)));
        assert_eq!(game.guarantee, MINIMUM_DOWNLOAD_RATE);
        assert_eq!(game.class_id, ClassId::new(1, 0x1000));
        assert_eq!(game.priority, 0);

        let browser = plan.leaf(Direction::Download, "Browser").unwrap();
        assert_eq!(browser.parent, Some(ObjectKey::Band(Direction::Download, 1)));
        assert_eq!(browser.ceiling, Some(Rate::from_bits_per_sec(2_500_000)));
        assert_eq!(browser.class_id, ClassId::new(1, 0x1001));
        assert_eq!(browser.priority, 1);

        // Leftover traffic queues behind both explicitly prioritized rules
        assert_eq!(
            download.default_leaf.parent,
            Some(ObjectKey::Band(Direction::Download, 2))
        );
        assert_eq!(download.default_leaf.guarantee, GLOBAL_MINIMUM_DOWNLOAD_RATE);
        assert_eq!(download.bands[2].guarantee, GLOBAL_MINIMUM_DOWNLOAD_RATE);
        assert_eq!(download.bands[0].guarantee, MINIMUM_DOWNLOAD_RATE);
        assert!(plan.warnings().is_empty());
    }

    #[test]
    fn test_uncapped_direction() {
        let plan = plan_for(GAME_AND_BROWSER);
        let upload = plan.direction(Direction::Upload);

        assert_eq!(upload.root.ceiling, None);
        assert_eq!(upload.bands.len(), 1);
        assert_eq!(plan.leaf(Direction::Upload, "Browser").unwrap().ceiling, None);
        assert_eq!(
            upload.default_leaf.parent,
            Some(ObjectKey::Band(Direction::Upload, 0))
        );
    }

    #[test]
    fn test_warnings_for_oversubscription_and_excess_rates() {
        let plan = plan_for(
            r#"
upload: 100kbit
upload-minimum: 90kbit
processes:
  Greedy:
    upload: 1mbit
    upload-minimum: 50kbit
    match:
      - name: greedy
"#,
        );

        let warnings = plan.warnings();
        assert!(warnings.iter().any(|w| w.contains("exceeds the global rate of 100kbit")));
        assert!(warnings.iter().any(|w| w.contains("upload rate of 1mbit")));
    }

    #[test]
    fn test_minimum_is_clamped_to_ceiling() {
        let plan = plan_for(
            r#"
processes:
  Tiny:
    download: 5kbit
    download-minimum: 50kbit
    match:
      - name: tiny
"#,
        );
        let tiny = plan.leaf(Direction::Download, "Tiny").unwrap();
        assert_eq!(tiny.guarantee, Rate::from_bits_per_sec(5_000));
        assert_eq!(plan.warnings().len(), 1);
    }

    #[test]
    fn test_desired_state_only_includes_bound_rules() {
        let plan = plan_for(GAME_AND_BROWSER);
        let config = GlobalConfig::from_yaml_str("eth0", GAME_AND_BROWSER).unwrap();
        let snapshot = ProcessSnapshot::new([
            ProcessRecord::new(100, 1, 7).with(ProcessAttribute::Name, "browser")
        ]);

        let desired = plan.desired_state(&bind(&config.rules, &snapshot));
        let process = ProcessIdentifier::new(100, 7);

        assert!(desired.contains_key(&ObjectKey::Leaf(Direction::Download, "Browser".into())));
        assert!(desired.contains_key(&ObjectKey::Leaf(Direction::Upload, "Browser".into())));
        assert!(desired.contains_key(&ObjectKey::Binding(
            Direction::Upload,
            "Browser".into(),
            process
        )));
        assert!(!desired.contains_key(&ObjectKey::Leaf(Direction::Download, "Game".into())));

        // Download traffic is steered by port, never by process
        assert!(!desired.keys().any(|key| matches!(
            key,
            ObjectKey::Binding(Direction::Download, _, _)
        )));

        let skeleton = plan.skeleton_objects().len();
        assert_eq!(desired.len(), skeleton + 3);
    }

    #[test]
    fn test_download_ports_become_port_filters() {
        let plan = plan_for(GAME_AND_BROWSER);
        let config = GlobalConfig::from_yaml_str("eth0", GAME_AND_BROWSER).unwrap();
        let snapshot = ProcessSnapshot::new([
            ProcessRecord::new(100, 1, 7)
                .with(ProcessAttribute::Name, "browser")
                .with_port(LocalPort::tcp(443))
                .with_port(LocalPort::udp(5353)),
            // Forked socket shared with a process of an earlier rule
            ProcessRecord::new(200, 1, 8)
                .with(ProcessAttribute::Name, "game")
                .with_port(LocalPort::udp(5353)),
        ]);

        let desired = plan.desired_state(&bind(&config.rules, &snapshot));

        let https = &desired[&ObjectKey::PortFilter(LocalPort::tcp(443))];
        let ShapingObject::PortFilter(https) = https else {
            panic!("expected a port filter, got {:?}", https);
        };
        assert_eq!(https.rule, "Browser");
        assert_eq!(https.class_id, ClassId::new(1, 0x1001));
        assert_eq!(https.leaf, ObjectKey::Leaf(Direction::Download, "Browser".into()));

        let shared = desired[&ObjectKey::PortFilter(LocalPort::udp(5353))].parent();
        assert_eq!(shared, Some(&ObjectKey::Leaf(Direction::Download, "Game".into())));
        assert_eq!(
            ObjectKey::PortFilter(LocalPort::tcp(443)).to_string(),
            "download/port tcp/443"
        );
    }
}
