//! Parquet snapshot of the store, with a checksum manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use aot_core::Opportunity;
use aot_storage::sort_by_closing_date;
use arrow_array::{ArrayRef, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `snapshots/opportunities.parquet`, `snapshots/portals.parquet` and
/// `snapshots/manifest.json` under `report_dir`. Returns the manifest path.
pub async fn export_snapshot(report_dir: &Path, run_id: Uuid, records: &[Opportunity]) -> Result<PathBuf> {
    let snapshot_dir = report_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let mut sorted = records.to_vec();
    sort_by_closing_date(&mut sorted);

    let opportunities_path = snapshot_dir.join("opportunities.parquet");
    let portals_path = snapshot_dir.join("portals.parquet");
    let opportunity_rows = write_opportunities_parquet(&opportunities_path, &sorted)?;
    let portal_rows = write_portals_parquet(&portals_path, &sorted)?;

    let manifest = SnapshotManifest {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        run_id,
        files: vec![
            manifest_entry("opportunities", report_dir, &opportunities_path, opportunity_rows)?,
            manifest_entry("portals", report_dir, &portals_path, portal_rows)?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn utf8(name: &str, nullable: bool) -> ArrowField {
    ArrowField::new(name, DataType::Utf8, nullable)
}

fn strings(values: impl Iterator<Item = Option<String>>) -> ArrayRef {
    Arc::new(StringArray::from(values.collect::<Vec<_>>()))
}

fn write_opportunities_parquet(path: &Path, records: &[Opportunity]) -> Result<usize> {
    let schema = Arc::new(Schema::new(vec![
        utf8("key", false),
        utf8("name", false),
        utf8("entity", false),
        utf8("category", true),
        utf8("areas", false),
        utf8("opening_date", true),
        utf8("closing_date", true),
        ArrowField::new("amount_value", DataType::Float64, true),
        utf8("amount_currency", true),
        utf8("source_url", true),
        utf8("source_portals", false),
        utf8("relevance", false),
        utf8("state", false),
        utf8("state_set_by", false),
        utf8("first_seen", false),
        utf8("last_seen", false),
        utf8("requirements", true),
        utf8("required_documents", true),
        utf8("notes", true),
    ]));

    let join = |items: &std::collections::BTreeSet<String>| items.iter().cloned().collect::<Vec<_>>().join("; ");
    let rs = records.iter();
    let batch = RecordBatch::try_new(
        schema,
        vec![
            strings(rs.clone().map(|r| Some(r.identity_key().map(|k| k.to_string()).unwrap_or_default()))),
            strings(rs.clone().map(|r| Some(r.name.clone()))),
            strings(rs.clone().map(|r| Some(r.entity.clone()))),
            strings(rs.clone().map(|r| r.category.value.map(|c| c.as_str().to_string()))),
            strings(rs.clone().map(|r| Some(join(&r.areas)))),
            strings(rs.clone().map(|r| r.opening_date.value.map(|d| d.to_string()))),
            strings(rs.clone().map(|r| r.closing_date.value.map(|d| d.to_string()))),
            Arc::new(Float64Array::from(
                records.iter().map(|r| r.amount.value.as_ref().map(|a| a.value)).collect::<Vec<_>>(),
            )),
            strings(rs.clone().map(|r| r.amount.value.as_ref().map(|a| a.currency.clone()))),
            strings(rs.clone().map(|r| r.source_url.value.clone())),
            strings(rs.clone().map(|r| Some(join(&r.source_portals)))),
            strings(rs.clone().map(|r| Some(r.relevance.as_str().to_string()))),
            strings(rs.clone().map(|r| Some(r.state.value.as_str().to_string()))),
            strings(rs.clone().map(|r| {
                Some(if r.has_state_override() { "human" } else { "engine" }.to_string())
            })),
            strings(rs.clone().map(|r| Some(r.first_seen.to_string()))),
            strings(rs.clone().map(|r| Some(r.last_seen.to_string()))),
            strings(rs.clone().map(|r| r.requirements.value.clone())),
            strings(rs.clone().map(|r| r.required_documents.value.clone())),
            strings(rs.map(|r| r.notes.value.clone())),
        ],
    )
    .context("building opportunities record batch")?;
    write_parquet(path, batch)?;
    Ok(records.len())
}

fn write_portals_parquet(path: &Path, records: &[Opportunity]) -> Result<usize> {
    let rows = records
        .iter()
        .flat_map(|r| {
            let key = r.identity_key().map(|k| k.to_string()).unwrap_or_default();
            r.source_portals
                .iter()
                .map(move |portal| (key.clone(), portal.clone()))
        })
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![utf8("key", false), utf8("source_id", false)]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            strings(rows.iter().map(|(k, _)| Some(k.clone()))),
            strings(rows.iter().map(|(_, p)| Some(p.clone()))),
        ],
    )
    .context("building portals record batch")?;
    write_parquet(path, batch)?;
    Ok(rows.len())
}

fn manifest_entry(name: &str, report_dir: &Path, path: &Path, rows: usize) -> Result<SnapshotFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(report_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use aot_core::{Attribution, Field, OpportunityState, RelevanceTier, Tracked};
    use arrow_array::cast::AsArray;
    use arrow_array::Array;
    use chrono::NaiveDate;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use std::collections::BTreeSet;

    fn record(name: &str, closing: Option<NaiveDate>, portals: &[&str]) -> Opportunity {
        let seen = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        Opportunity {
            name: name.into(),
            entity: "DAAD".into(),
            description: Field::empty(),
            category: Field::empty(),
            areas: BTreeSet::new(),
            opening_date: Field::empty(),
            closing_date: Field::from_option(closing, Attribution::automated("daad", seen)),
            amount: Field::empty(),
            source_url: Field::empty(),
            requirements: Field::empty(),
            required_documents: Field::empty(),
            notes: Field::empty(),
            source_portals: portals.iter().map(|p| p.to_string()).collect(),
            relevance: RelevanceTier::Low,
            state: Tracked::new(OpportunityState::New, Attribution::engine(seen)),
            first_seen: seen,
            last_seen: seen,
            past_due_noted: None,
        }
    }

    #[tokio::test]
    async fn snapshot_writes_sorted_rows_and_checksums() {
        let dir = tempfile::tempdir().unwrap();
        let mut records = vec![
            record("Sin fecha", None, &["daad"]),
            record("Tarde", NaiveDate::from_ymd_opt(2025, 9, 1), &["daad", "manual"]),
            record("Pronto", NaiveDate::from_ymd_opt(2025, 4, 1), &[]),
        ];
        records[2].required_documents = Field::with_value(
            "pasaporte vigente".into(),
            Attribution::automated("daad", NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()),
        );
        let manifest_path = export_snapshot(dir.path(), Uuid::new_v4(), &records).await.unwrap();

        let manifest: serde_json::Value = serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        let files = manifest["files"].as_array().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0]["path"], "snapshots/opportunities.parquet");
        assert_eq!(files[0]["rows"], 3);
        assert_eq!(files[1]["rows"], 3);
        assert_eq!(files[0]["sha256"].as_str().unwrap().len(), 64);

        let file = File::open(dir.path().join("snapshots/opportunities.parquet")).unwrap();
        let mut reader = ParquetRecordBatchReaderBuilder::try_new(file).unwrap().build().unwrap();
        let batch = reader.next().unwrap().unwrap();
        let names = batch
            .column(1)
            .as_string::<i32>()
            .iter()
            .map(|v| v.unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["Pronto", "Tarde", "Sin fecha"]);
        let documents = batch.column_by_name("required_documents").unwrap().as_string::<i32>();
        assert_eq!(documents.value(0), "pasaporte vigente");
        assert!(documents.is_null(1));
    }
}
