//! Call detail records.
//!
//! Every terminated transaction produces one record. Records flow over a
//! channel to a dedicated writer thread so transaction teardown never
//! blocks on disk; the file is JSON-lines, one record per line.

use crossbeam_channel::{unbounded, Sender};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::thread::JoinHandle;
use tracing::{error, info};

/// One terminated transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdrRecord {
    /// Stamped by the writer thread at write time, RFC 3339.
    #[serde(default)]
    pub logged_at: String,
    /// Service type name (MOC, MTC, MOSMS, ...).
    pub kind: String,
    pub tran_id: u64,
    pub to_imsi: String,
    pub from_imsi: String,
    pub to_number: String,
    pub from_number: String,
    /// Peer BTS for handover legs, else empty.
    pub peer: String,
    /// Connect time, seconds since the epoch; 0 if never connected.
    pub connect_time: u64,
    /// Connected duration in seconds.
    pub duration: u64,
    /// Body size for message transactions.
    pub message_size: usize,
    pub handover_in: bool,
    pub handover_out: bool,
    pub termination_cause: String,
}

/// Cloneable handle that feeds the writer thread.
#[derive(Clone)]
pub struct CdrSender {
    tx: Option<Sender<CdrRecord>>,
}

impl CdrSender {
    /// A sender that drops records; used when no CDR file is configured
    /// and in tests that do not care.
    pub fn disabled() -> CdrSender {
        CdrSender { tx: None }
    }

    pub fn write(&self, record: CdrRecord) {
        match &self.tx {
            Some(tx) => {
                if tx.send(record).is_err() {
                    error!("CDR writer gone, record dropped");
                }
            }
            None => {
                info!(kind = %record.kind, tran = record.tran_id, cause = %record.termination_cause,
                    "CDR (no file configured)");
            }
        }
    }
}

/// The CDR service: writer thread plus its feeding handle.
pub struct CdrService {
    pub sender: CdrSender,
    handle: Option<JoinHandle<()>>,
}

impl CdrService {
    /// Spawn the writer appending to `path`.
    pub fn start(path: PathBuf) -> CdrService {
        let (tx, rx) = unbounded::<CdrRecord>();
        let handle = std::thread::Builder::new()
            .name("cdr-writer".into())
            .spawn(move || {
                let mut file = match OpenOptions::new().create(true).append(true).open(&path) {
                    Ok(f) => f,
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "cannot open CDR file");
                        // Drain and drop so senders never block.
                        for _ in rx.iter() {}
                        return;
                    }
                };
                for mut record in rx.iter() {
                    record.logged_at = chrono::Utc::now().to_rfc3339();
                    match serde_json::to_string(&record) {
                        Ok(line) => {
                            if let Err(e) = writeln!(file, "{}", line) {
                                error!(error = %e, "CDR write failed");
                            }
                        }
                        Err(e) => error!(error = %e, "CDR serialize failed"),
                    }
                }
            })
            .expect("spawn cdr writer");
        CdrService {
            sender: CdrSender { tx: Some(tx) },
            handle: Some(handle),
        }
    }

    /// Close the queue and join the writer.
    pub fn shutdown(mut self) {
        self.sender.tx = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> CdrRecord {
        CdrRecord {
            logged_at: String::new(),
            kind: "MOC".into(),
            tran_id: 7,
            to_imsi: String::new(),
            from_imsi: "001010123456789".into(),
            to_number: "+15551234".into(),
            from_number: String::new(),
            peer: String::new(),
            connect_time: 1_700_000_000,
            duration: 60,
            message_size: 0,
            handover_in: false,
            handover_out: false,
            termination_cause: "NormalCallClearing".into(),
        }
    }

    #[test]
    fn writer_produces_json_lines() {
        let dir = std::env::temp_dir().join(format!("cdr-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cdr.jsonl");
        let service = CdrService::start(path.clone());
        service.sender.write(record());
        service.sender.write(record());
        service.shutdown();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: CdrRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.kind, "MOC");
        assert_eq!(parsed.duration, 60);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn disabled_sender_is_a_noop() {
        CdrSender::disabled().write(record());
    }
}
