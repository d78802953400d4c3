use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use engine::store::{SinkError, StoreSink, WriteRecord};

/// Append-only JSONL tier: one file per logical table. Replaying a file
/// into any idempotent upsert target reproduces the row set, which is all
/// the engine requires of a store.
pub struct JsonlSink {
    orders: Mutex<File>,
    trades: Mutex<File>,
    positions: Mutex<File>,
}

impl JsonlSink {
    pub fn open(dir: &str) -> std::io::Result<Self> {
        fs::create_dir_all(dir)?;
        let open = |name: &str| -> std::io::Result<Mutex<File>> {
            let mut path = PathBuf::from(dir);
            path.push(name);
            Ok(Mutex::new(
                OpenOptions::new().create(true).append(true).open(path)?,
            ))
        };
        Ok(JsonlSink {
            orders: open("orders.jsonl")?,
            trades: open("trades.jsonl")?,
            positions: open("positions.jsonl")?,
        })
    }

    fn append(file: &Mutex<File>, record: &WriteRecord) -> Result<(), SinkError> {
        let line = serde_json::to_string(record).map_err(|err| SinkError(err.to_string()))?;
        let mut file = file.lock().expect("sink file lock");
        writeln!(file, "{line}").map_err(|err| SinkError(err.to_string()))
    }
}

impl StoreSink for JsonlSink {
    fn apply(&self, record: &WriteRecord) -> Result<(), SinkError> {
        match record {
            WriteRecord::UpsertOrder(_) => Self::append(&self.orders, record),
            WriteRecord::InsertTrade(_) => Self::append(&self.trades, record),
            WriteRecord::UpsertPosition(_) => Self::append(&self.positions, record),
        }
    }
}
