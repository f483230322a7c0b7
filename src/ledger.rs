use crate::error::{BotError, Result};
use crate::models::TradeRecord;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// Append-only CSV trade log. One row per closed trade, header written on
/// first use, rows never updated. A lost row must never take trading down,
/// so callers log `LedgerWrite` errors and continue.
pub struct CsvLedger {
    path: PathBuf,
}

impl CsvLedger {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn append(&self, record: &TradeRecord) -> Result<()> {
        let needs_header = match std::fs::metadata(&self.path) {
            Ok(metadata) => metadata.len() == 0,
            Err(_) => true,
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| BotError::LedgerWrite(format!("open {:?}: {}", self.path, err)))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if needs_header {
            writer
                .write_record(["time", "side", "entry", "exit", "outcome", "pnl_base"])
                .map_err(|err| BotError::LedgerWrite(err.to_string()))?;
        }

        writer
            .write_record([
                record.closed_at.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
                record.side.as_str().to_string(),
                format_rounded(record.entry_price),
                format_rounded(record.exit_price),
                record.outcome.as_str().to_string(),
                format_rounded(record.pnl_base),
            ])
            .map_err(|err| BotError::LedgerWrite(err.to_string()))?;

        writer
            .flush()
            .map_err(|err| BotError::LedgerWrite(err.to_string()))
    }
}

fn format_rounded(value: f64) -> String {
    format!("{:.6}", value)
}
