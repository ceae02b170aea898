//! Optional append-only JSONL audit log.
//!
//! Records fills, level transitions, risk events, and the final status
//! record for offline inspection. Write-only and best-effort: the log is
//! never consulted on restart (the exchange is the source of truth) and a
//! write failure must never take down the trading path.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::warn;

use hedge_common::Direction;

use crate::state::MetricsSnapshot;

/// One audit record.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    OrderPlaced {
        direction: Direction,
        level_id: u32,
        client_order_id: String,
        price: Decimal,
        qty: Decimal,
    },
    OrderFilled {
        direction: Direction,
        level_id: u32,
        client_order_id: String,
        avg_price: Decimal,
        qty: Decimal,
    },
    LevelTransition {
        direction: Direction,
        level_id: u32,
        from: String,
        to: String,
    },
    RiskEvent {
        reason: String,
    },
    FinalStatus {
        epoch_id: u64,
        long_metrics: MetricsSnapshot,
        short_metrics: MetricsSnapshot,
        long_realized_pnl: Decimal,
        short_realized_pnl: Decimal,
    },
}

#[derive(Serialize)]
struct AuditLine<'a> {
    ts: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a AuditEvent,
}

/// Append-only JSONL writer.
pub struct AuditLog {
    file: Mutex<File>,
}

impl AuditLog {
    /// Open (or create) the log file for appending.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Append one event. Failures are logged and swallowed.
    pub fn record(&self, event: &AuditEvent) {
        let line = AuditLine {
            ts: Utc::now(),
            event,
        };
        let serialized = match serde_json::to_string(&line) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "audit event serialization failed");
                return;
            }
        };
        let mut file = self.file.lock();
        if let Err(e) = writeln!(file, "{}", serialized) {
            warn!(error = %e, "audit log write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::path::PathBuf;

    struct TempLog(PathBuf);

    impl TempLog {
        fn new() -> Self {
            let path =
                std::env::temp_dir().join(format!("hedge-audit-{}.jsonl", uuid::Uuid::new_v4()));
            Self(path)
        }
    }

    impl Drop for TempLog {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[test]
    fn test_events_append_as_jsonl() {
        let tmp = TempLog::new();
        let path = &tmp.0;
        let log = AuditLog::open(path).unwrap();

        log.record(&AuditEvent::OrderPlaced {
            direction: Direction::Long,
            level_id: 3,
            client_order_id: "hg1-3-0".into(),
            price: dec!(0.99740),
            qty: dec!(10),
        });
        log.record(&AuditEvent::RiskEvent {
            reason: "channel breakout".into(),
        });

        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "order_placed");
        assert_eq!(first["level_id"], 3);
        assert!(first["ts"].is_string());

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["event"], "risk_event");
    }

    #[test]
    fn test_reopen_appends() {
        let tmp = TempLog::new();
        {
            let log = AuditLog::open(&tmp.0).unwrap();
            log.record(&AuditEvent::RiskEvent { reason: "a".into() });
        }
        {
            let log = AuditLog::open(&tmp.0).unwrap();
            log.record(&AuditEvent::RiskEvent { reason: "b".into() });
        }
        let content = std::fs::read_to_string(&tmp.0).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
