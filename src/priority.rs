//! Priority banding
//!
//! Rules and the leftover traffic of each direction are sorted into dense
//! bands starting at 0, lower bands being served first. Bands are computed
//! once per configuration, never per process.

use crate::config::{Direction, GlobalConfig};
use std::collections::{BTreeMap, BTreeSet};

/// Dense priority band, 0 is the most important
pub type Band = u16;

/// Band assignment for both directions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandPair {
    pub download: Band,
    pub upload: Band,
}

impl BandPair {
    pub fn get(&self, direction: Direction) -> Band {
        match direction {
            Direction::Download => self.download,
            Direction::Upload => self.upload,
        }
    }
}

/// Bands for the leftover traffic and for every rule, in declaration order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBands {
    pub global: BandPair,
    pub rules: Vec<(String, BandPair)>,
}

impl ResolvedBands {
    pub fn rule(&self, label: &str) -> Option<BandPair> {
        self.rules
            .iter()
            .find(|(rule_label, _)| rule_label == label)
            .map(|(_, bands)| *bands)
    }

    /// Every band holding at least one rule or the leftover traffic
    pub fn bands_in_use(&self, direction: Direction) -> BTreeSet<Band> {
        std::iter::once(self.global.get(direction))
            .chain(self.rules.iter().map(|(_, bands)| bands.get(direction)))
            .collect()
    }
}

struct DirectionBands {
    global: Band,
    rules: Vec<Band>,
}

fn resolve_direction(config: &GlobalConfig, direction: Direction) -> DirectionBands {
    let explicit_max = config
        .rules
        .iter()
        .filter_map(|rule| rule.limits(direction).priority)
        .max();

    // Unprioritized rules queue behind every explicitly prioritized one
    let implicit = explicit_max.map_or(0, |max| u64::from(max) + 1);

    let rule_priorities: Vec<u64> = config
        .rules
        .iter()
        .map(|rule| {
            rule.limits(direction)
                .priority
                .map_or(implicit, u64::from)
        })
        .collect();
    let global_priority = config
        .limits(direction)
        .priority
        .map_or(implicit, u64::from);

    let dense: BTreeMap<u64, Band> = rule_priorities
        .iter()
        .copied()
        .chain(std::iter::once(global_priority))
        .collect::<BTreeSet<u64>>()
        .into_iter()
        .zip(0..)
        .collect();

    DirectionBands {
        global: dense[&global_priority],
        rules: rule_priorities.iter().map(|p| dense[p]).collect(),
    }
}

/// Assign bands to the leftover traffic and every rule of `config`
pub fn resolve_bands(config: &GlobalConfig) -> ResolvedBands {
    let download = resolve_direction(config, Direction::Download);
    let upload = resolve_direction(config, Direction::Upload);

    ResolvedBands {
        global: BandPair {
            download: download.global,
            upload: upload.global,
        },
        rules: config
            .rules
            .iter()
            .zip(download.rules.iter().zip(upload.rules.iter()))
            .map(|(rule, (&download, &upload))| {
                (rule.label.clone(), BandPair { download, upload })
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(yaml: &str) -> GlobalConfig {
        GlobalConfig::from_yaml_str("eth0", yaml).unwrap()
    }

    #[test]
    fn test_no_explicit_priorities_means_single_band() {
        let bands = resolve_bands(&config(
            r#"
processes:
  a: { match: [ { name: a } ] }
  b: { match: [ { name: b } ] }
"#,
        ));

        assert_eq!(bands.global, BandPair { download: 0, upload: 0 });
        assert_eq!(bands.rule("a"), Some(BandPair { download: 0, upload: 0 }));
        assert_eq!(bands.rule("b"), Some(BandPair { download: 0, upload: 0 }));
        assert_eq!(bands.bands_in_use(Direction::Download), BTreeSet::from([0]));
    }

    #[test]
    fn test_unset_priorities_go_after_explicit_ones() {
        let bands = resolve_bands(&config(
            r#"
processes:
  Game: { download-priority: 0, upload-priority: 0, match: [ { name: game } ] }
  Browser: { download-priority: 1, match: [ { name: browser } ] }
  Updater: { match: [ { name: updater } ] }
"#,
        ));

        assert_eq!(bands.rule("Game"), Some(BandPair { download: 0, upload: 0 }));
        assert_eq!(bands.rule("Browser"), Some(BandPair { download: 1, upload: 1 }));
        assert_eq!(bands.rule("Updater"), Some(BandPair { download: 2, upload: 1 }));
        assert_eq!(bands.global, BandPair { download: 2, upload: 1 });
        assert_eq!(
            bands.bands_in_use(Direction::Download),
            BTreeSet::from([0, 1, 2])
        );
        assert_eq!(bands.bands_in_use(Direction::Upload), BTreeSet::from([0, 1]));
    }

    #[test]
    fn test_shared_explicit_priority_shares_a_band() {
        let bands = resolve_bands(&config(
            r#"
processes:
  voip: { upload-priority: 0, match: [ { name: voip } ] }
  game: { upload-priority: 0, match: [ { name: game } ] }
"#,
        ));

        assert_eq!(bands.rule("voip").unwrap().upload, 0);
        assert_eq!(bands.rule("game").unwrap().upload, 0);
        assert_eq!(bands.global.upload, 1);
        // Download has no explicit priority at all
        assert_eq!(bands.global.download, 0);
    }

    #[test]
    fn test_sparse_priorities_are_compacted() {
        let bands = resolve_bands(&config(
            r#"
processes:
  low: { download-priority: 10, match: [ { name: low } ] }
  high: { download-priority: 3, match: [ { name: high } ] }
"#,
        ));

        assert_eq!(bands.rule("high").unwrap().download, 0);
        assert_eq!(bands.rule("low").unwrap().download, 1);
        assert_eq!(bands.global.download, 2);
    }

    #[test]
    fn test_global_priority_overrides_leftover_band() {
        let bands = resolve_bands(&config(
            r#"
download-priority: 0
processes:
  bulk: { download-priority: 5, match: [ { name: torrent } ] }
  misc: { match: [ { name: misc } ] }
"#,
        ));

        assert_eq!(bands.global.download, 0);
        assert_eq!(bands.rule("bulk").unwrap().download, 1);
        assert_eq!(bands.rule("misc").unwrap().download, 2);
    }

    #[test]
    fn test_resolution_is_stable() {
        let config = config(
            r#"
processes:
  x: { download-priority: 4, match: [ { name: x } ] }
  y: { match: [ { name: y } ] }
"#,
        );
        assert_eq!(resolve_bands(&config), resolve_bands(&config));
    }
}
