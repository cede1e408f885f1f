// Controller error register decoding
//
// Every bit of the 16-bit register is an independent condition and several can
// be raised at once, so decoding reports all of them, least significant first.

use serde::{Deserialize, Serialize};

/// Home switch reached on M1 / M2
pub const HOME_M1: u16 = 0x4000;
pub const HOME_M2: u16 = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Ok,
    Warn,
    Error,
    /// Bit not described by the catalog (newer firmware)
    Unknown,
}

impl Severity {
    /// Ordering used to pick a summary: Unknown ranks between Warn and Error
    fn rank(self) -> u8 {
        match self {
            Severity::Ok => 0,
            Severity::Warn => 1,
            Severity::Unknown => 2,
            Severity::Error => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub bit: u16,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Copy)]
pub struct CatalogEntry {
    pub bit: u16,
    pub severity: Severity,
    pub message: &'static str,
}

const fn entry(bit: u16, severity: Severity, message: &'static str) -> CatalogEntry {
    CatalogEntry {
        bit,
        severity,
        message,
    }
}

const NORMAL: &str = "Normal";

/// RoboClaw 2x7A/2x15A error register
pub const ROBOCLAW_ERRORS: &[CatalogEntry] = &[
    entry(0x0001, Severity::Warn, "M1 over current"),
    entry(0x0002, Severity::Warn, "M2 over current"),
    entry(0x0004, Severity::Error, "Emergency Stop"),
    entry(0x0008, Severity::Error, "Temperature1"),
    entry(0x0010, Severity::Error, "Temperature2"),
    entry(0x0020, Severity::Error, "Main batt voltage high"),
    entry(0x0040, Severity::Error, "Logic batt voltage high"),
    entry(0x0080, Severity::Error, "Logic batt voltage low"),
    entry(0x0100, Severity::Warn, "M1 driver fault"),
    entry(0x0200, Severity::Warn, "M2 driver fault"),
    entry(0x0400, Severity::Warn, "Main batt voltage high"),
    entry(0x0800, Severity::Warn, "Main batt voltage low"),
    entry(0x1000, Severity::Warn, "Temperature1"),
    entry(0x2000, Severity::Warn, "Temperature2"),
    entry(HOME_M1, Severity::Ok, "M1 home"),
    entry(HOME_M2, Severity::Ok, "M2 home"),
];

#[derive(Debug, Clone, Copy)]
pub struct ErrorCatalog {
    entries: &'static [CatalogEntry],
}

impl Default for ErrorCatalog {
    fn default() -> Self {
        Self::new(ROBOCLAW_ERRORS)
    }
}

impl ErrorCatalog {
    pub const fn new(entries: &'static [CatalogEntry]) -> Self {
        Self { entries }
    }

    fn lookup(&self, bit: u16) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.bit == bit)
    }

    /// Decode every set bit. Never empty: a clear register yields "Normal".
    pub fn decode(&self, bitmask: u16) -> Vec<ErrorReport> {
        if bitmask == 0 {
            return vec![ErrorReport {
                bit: 0,
                severity: Severity::Ok,
                message: NORMAL.to_string(),
            }];
        }

        (0..16)
            .map(|shift| 1u16 << shift)
            .filter(|bit| bitmask & bit != 0)
            .map(|bit| match self.lookup(bit) {
                Some(e) => ErrorReport {
                    bit,
                    severity: e.severity,
                    message: e.message.to_string(),
                },
                None => ErrorReport {
                    bit,
                    severity: Severity::Unknown,
                    message: format!("Unknown error 0x{:04X}", bit),
                },
            })
            .collect()
    }
}

/// Decode with the RoboClaw table
pub fn decode(bitmask: u16) -> Vec<ErrorReport> {
    ErrorCatalog::default().decode(bitmask)
}

/// Single-line health summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub severity: Severity,
    pub message: String,
}

/// Summarize a decoded report: the worst severity, with the messages of
/// every entry at that severity joined in bit order
pub fn summarize(reports: &[ErrorReport]) -> Summary {
    let worst = reports
        .iter()
        .map(|r| r.severity)
        .max_by_key(|s| s.rank())
        .unwrap_or(Severity::Ok);

    let message = reports
        .iter()
        .filter(|r| r.severity == worst)
        .map(|r| r.message.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    Summary {
        severity: worst,
        message: if message.is_empty() {
            NORMAL.to_string()
        } else {
            message
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emergency_stop() {
        let reports = decode(0x0004);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].severity, Severity::Error);
        assert_eq!(reports[0].message, "Emergency Stop");
    }

    #[test]
    fn test_clear_register_is_normal() {
        let reports = decode(0);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].severity, Severity::Ok);
        assert_eq!(reports[0].message, "Normal");
    }

    #[test]
    fn test_multiple_bits_reported_lsb_first() {
        let reports = decode(0x0104);
        let bits: Vec<u16> = reports.iter().map(|r| r.bit).collect();
        assert_eq!(bits, vec![0x0004, 0x0100]);
        assert_eq!(reports[1].severity, Severity::Warn);
    }

    #[test]
    fn test_decode_is_total_and_deterministic() {
        for bitmask in 0..=u16::MAX {
            let reports = decode(bitmask);
            assert!(!reports.is_empty());
            assert_eq!(reports.len(), bitmask.count_ones().max(1) as usize);
            assert!(reports.windows(2).all(|w| w[0].bit < w[1].bit));
        }
        assert_eq!(decode(0xFFFF), decode(0xFFFF));
    }

    #[test]
    fn test_severity_assignments() {
        let severity = |bit| decode(bit)[0].severity;
        for bit in [0x0004, 0x0008, 0x0010, 0x0020, 0x0040, 0x0080] {
            assert_eq!(severity(bit), Severity::Error, "bit 0x{bit:04X}");
        }
        for bit in [0x0100, 0x0200, 0x0400, 0x0800] {
            assert_eq!(severity(bit), Severity::Warn, "bit 0x{bit:04X}");
        }
        assert_eq!(severity(HOME_M1), Severity::Ok);
        assert_eq!(severity(HOME_M2), Severity::Ok);
    }

    #[test]
    fn test_unknown_bit_is_reported() {
        static PARTIAL: &[CatalogEntry] = &[entry(0x0004, Severity::Error, "Emergency Stop")];
        let catalog = ErrorCatalog::new(PARTIAL);

        let reports = catalog.decode(0x0204);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].severity, Severity::Unknown);
        assert_eq!(reports[1].message, "Unknown error 0x0200");
    }

    #[test]
    fn test_summary_takes_worst_severity() {
        let summary = summarize(&decode(0x0101 | 0x0004));
        assert_eq!(summary.severity, Severity::Error);
        assert_eq!(summary.message, "Emergency Stop");

        let summary = summarize(&decode(0x0003));
        assert_eq!(summary.severity, Severity::Warn);
        assert_eq!(summary.message, "M1 over current, M2 over current");

        assert_eq!(summarize(&decode(0)).message, "Normal");
    }
}
