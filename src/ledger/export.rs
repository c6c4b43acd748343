//! Chain Export
//!
//! Writes one partition's whole chain to a JSONL file with a
//! `sha256sum`-style checksum and a JSON manifest beside it, and
//! re-verifies such files offline. Exports always start at genesis, so a
//! replay is anchored at the empty hash and must end on the recorded head.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::event::{AuditEvent, TenantKey};
use crate::ledger::verify::{display_hash, verify_segment, FindingKind, PartitionReport};
use crate::ledger::Ledger;
use crate::store::LedgerStore;

/// What an export wrote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub tenant_key: TenantKey,
    pub path: PathBuf,
    pub checksum_path: PathBuf,
    pub rows: usize,
    pub sha256: String,
    pub first_prev_hash: Option<String>,
    pub last_event_id: Option<Uuid>,
    pub last_event_hash: Option<String>,
    pub exported_at: DateTime<Utc>,
}

/// Result of re-verifying an export file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportVerification {
    pub path: PathBuf,
    pub checksum_ok: bool,
    /// Checksum recorded beside the export, if the file was present.
    pub expected_sha256: Option<String>,
    pub actual_sha256: String,
    /// The manifest is present and describes this file.
    pub manifest_ok: bool,
    pub report: PartitionReport,
}

impl ExportVerification {
    pub fn ok(&self) -> bool {
        self.checksum_ok && self.manifest_ok && self.report.ok
    }
}

/// Path of the manifest kept beside an export.
pub fn manifest_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".manifest.json");
    PathBuf::from(name)
}

fn load_manifest(path: &Path) -> Option<ExportManifest> {
    let raw = match fs::read_to_string(manifest_path(path)) {
        Ok(raw) => raw,
        Err(_) => return None,
    };
    match serde_json::from_str(&raw) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "export manifest unreadable");
            None
        }
    }
}

/// Path of the checksum file kept beside an export.
pub fn checksum_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}

fn sha256_file(path: &Path) -> LedgerResult<String> {
    let bytes = fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Load an export back into events, in file order.
pub fn load_export(path: &Path) -> LedgerResult<Vec<AuditEvent>> {
    let file = File::open(path)
        .map_err(|e| LedgerError::Export(format!("cannot open {}: {}", path.display(), e)))?;

    let mut events = Vec::new();
    for (line_num, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: AuditEvent = serde_json::from_str(&line).map_err(|e| {
            LedgerError::Serialization(format!("line {}: {}", line_num + 1, e))
        })?;
        events.push(event);
    }
    Ok(events)
}

/// Check an export's checksum and manifest, and replay its chain from
/// genesis to the head recorded in the manifest.
pub fn verify_export(path: &Path) -> LedgerResult<ExportVerification> {
    verify_export_with(path, None)
}

/// As [`verify_export`], but the replay must end on `expected_head`, a
/// chain head taken from somewhere other than the files being checked
/// (the live ChainState, or a copy of the manifest kept elsewhere).
pub fn verify_export_with(path: &Path, expected_head: Option<&str>) -> LedgerResult<ExportVerification> {
    let actual_sha256 = sha256_file(path)?;

    let sidecar = checksum_path(path);
    let expected_sha256 = if sidecar.exists() {
        fs::read_to_string(&sidecar)?
            .split_whitespace()
            .next()
            .map(str::to_lowercase)
    } else {
        None
    };
    let checksum_ok = expected_sha256.as_deref() == Some(actual_sha256.as_str());
    if !checksum_ok {
        warn!(path = %path.display(), "export checksum missing or mismatched");
    }

    let events = load_export(path)?;
    let manifest = load_manifest(path);
    let tenant_key = events
        .first()
        .map(|e| e.tenant_key.clone())
        .or_else(|| manifest.as_ref().map(|m| m.tenant_key.clone()))
        .unwrap_or_else(TenantKey::system);
    if let Some(stray) = events.iter().find(|e| e.tenant_key != tenant_key) {
        return Err(LedgerError::Export(format!(
            "export mixes partitions {} and {}",
            tenant_key, stray.tenant_key
        )));
    }

    let manifest_ok = manifest.as_ref().is_some_and(|m| {
        m.tenant_key == tenant_key && m.rows == events.len() && m.sha256 == actual_sha256
    });
    if !manifest_ok {
        warn!(path = %path.display(), "export manifest missing or does not describe the file");
    }

    let mut report = verify_segment(&tenant_key, &events, "");
    let recorded_head = manifest
        .as_ref()
        .map(|m| m.last_event_hash.clone().unwrap_or_default());
    let expected_head = expected_head.map(str::to_string).or(recorded_head);
    if let Some(expected_head) = expected_head.filter(|_| report.ok) {
        let walked = events.last().map(|e| e.event_hash.as_str()).unwrap_or("");
        if walked != expected_head {
            report = PartitionReport::finding(
                tenant_key.clone(),
                FindingKind::TruncatedTail,
                manifest.as_ref().and_then(|m| m.last_event_id),
                events.len(),
                format!(
                    "export ends at {} but the head is {}",
                    display_hash(walked),
                    display_hash(&expected_head)
                ),
            );
        }
    }

    info!(
        path = %path.display(),
        checksum_ok,
        manifest_ok,
        chain_ok = report.ok,
        events = report.events_checked,
        "export verified"
    );
    Ok(ExportVerification {
        path: path.to_path_buf(),
        checksum_ok,
        expected_sha256,
        actual_sha256,
        manifest_ok,
        report,
    })
}

impl<S: LedgerStore> Ledger<S> {
    /// Write a partition's chain, oldest first, into `dir`.
    pub async fn export_partition(&self, partition: &TenantKey, dir: &Path) -> LedgerResult<ExportManifest> {
        let snapshot = self.store().load_partition(partition).await?;
        if let Some(bad) = snapshot.undecodable.first() {
            return Err(LedgerError::Export(format!(
                "partition {} has a stored row that cannot be decoded at position {}: {}",
                partition, bad.position, bad.reason
            )));
        }
        let exported_at = Utc::now();

        fs::create_dir_all(dir)?;
        let file_name = format!(
            "audit-{}-{}.jsonl",
            partition,
            exported_at.format("%Y%m%dT%H%M%S%.6fZ")
        );
        let path = dir.join(&file_name);

        let mut writer = BufWriter::new(File::create(&path)?);
        for event in &snapshot.events {
            serde_json::to_writer(&mut writer, event)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        drop(writer);

        let sha256 = sha256_file(&path)?;
        let checksum_path = checksum_path(&path);
        fs::write(&checksum_path, format!("{}  {}\n", sha256, file_name))?;

        let manifest = ExportManifest {
            tenant_key: partition.clone(),
            checksum_path,
            rows: snapshot.events.len(),
            sha256,
            first_prev_hash: snapshot.events.first().map(|e| e.prev_hash.clone()),
            last_event_id: snapshot.events.last().map(|e| e.id),
            last_event_hash: snapshot.events.last().map(|e| e.event_hash.clone()),
            exported_at,
            path,
        };
        fs::write(
            manifest_path(&manifest.path),
            serde_json::to_string_pretty(&manifest)?,
        )?;

        info!(
            tenant_key = %partition,
            path = %manifest.path.display(),
            rows = manifest.rows,
            sha256 = %manifest.sha256,
            "partition exported"
        );
        Ok(manifest)
    }
}
