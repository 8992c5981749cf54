//! Password-protected portable export and import
//!
//! An export is every user table serialized as pretty JSON,
//! `{ "<table>": [ { "<column>": value, ... } ] }`, then encrypted under a key
//! derived from a user password:
//!
//! ```text
//! salt[32] | iv[16] | tag[16] | ciphertext[N]
//! ```
//!
//! Column values are copied as stored, so sensitive columns stay encrypted
//! under the record-field secret inside the archive as well.

use crate::database::{
    json_to_sql, list_user_tables, open_read_only, open_read_write, query_records,
    quote_identifier, table_columns, table_exists,
};
use crate::encryption::{open_in_place, pack_salted, seal_in_place, split_salted};
use crate::error::WRONG_PASSWORD_MESSAGE;
use crate::models::{ImportMode, ImportReport, TableImportStats};
use crate::record_codec::Record;
use crate::security::{derive_password_key, generate_iv, generate_salt, TransferPassword};
use crate::{run_blocking, Error, Result};
use chrono::NaiveDateTime;
use rusqlite::{params_from_iter, Transaction};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

type Archive = BTreeMap<String, Vec<Record>>;

/// Download name for an export taken at `now`,
/// e.g. `health-data-export-2024-05-01T09-30-00.enc`
pub fn export_file_name(now: NaiveDateTime) -> String {
    format!("health-data-export-{}.enc", now.format("%Y-%m-%dT%H-%M-%S"))
}

/// Export every table of `db_path` as an encrypted archive.
pub fn export_encrypted<P: AsRef<Path>>(db_path: P, password: &str) -> Result<Vec<u8>> {
    let password = TransferPassword::new(password)?;
    let conn = open_read_only(db_path)?;

    let mut archive = Archive::new();
    for table in list_user_tables(&conn)? {
        let sql = format!("SELECT * FROM {}", quote_identifier(&table));
        let rows = query_records(&conn, &sql, [])?;
        debug!(table = %table, rows = rows.len(), "Exported table");
        archive.insert(table, rows);
    }
    let row_count: usize = archive.values().map(Vec::len).sum();

    let mut buffer = Zeroizing::new(serde_json::to_vec_pretty(&archive)?);
    let salt = generate_salt();
    let iv = generate_iv();
    let key = derive_password_key(&password, &salt)?;
    let tag = seal_in_place(&key, &iv, buffer.as_mut_slice())?;

    info!(tables = archive.len(), rows = row_count, "Encrypted export created");
    Ok(pack_salted(&salt, &iv, &tag, &buffer))
}

/// Decrypt `archive` and apply it to the database at `target`.
///
/// All changes are made in one transaction: on any error the target is left
/// as it was.
pub fn import_encrypted<P: AsRef<Path>>(
    archive: &[u8],
    password: &str,
    target: P,
    mode: ImportMode,
) -> Result<ImportReport> {
    let password = TransferPassword::new(password)?;
    let (salt, iv, tag, ciphertext) =
        split_salted(archive).ok_or(Error::Authentication(WRONG_PASSWORD_MESSAGE))?;

    let key = derive_password_key(&password, salt)?;
    let mut buffer = Zeroizing::new(ciphertext.to_vec());
    open_in_place(&key, iv, tag, buffer.as_mut_slice(), WRONG_PASSWORD_MESSAGE)?;
    let tables: Archive = serde_json::from_slice(&buffer)?;
    debug!(tables = tables.len(), mode = %mode, "Decrypted archive");

    let mut conn = open_read_write(target)?;
    let tx = conn.transaction()?;

    for (table, rows) in &tables {
        if !rows.is_empty() && !table_exists(&tx, table)? {
            return Err(Error::Validation(format!(
                "Table '{}' in archive does not exist in target database",
                table
            )));
        }
    }

    if mode == ImportMode::Replace {
        for table in tables.keys() {
            if table_exists(&tx, table)? {
                let cleared = tx.execute(&format!("DELETE FROM {}", quote_identifier(table)), [])?;
                info!(table = %table, rows = cleared, "Cleared table before replace");
            }
        }
    }

    let mut report = ImportReport::new(mode);
    for (table, rows) in &tables {
        let stats = if rows.is_empty() {
            TableImportStats::default()
        } else {
            import_table(&tx, table, rows, mode)?
        };
        report.record(table.clone(), stats);
    }

    tx.commit()?;
    info!(
        mode = %mode,
        inserted = report.total_inserted,
        updated = report.total_updated,
        skipped = report.total_skipped,
        "Import complete"
    );
    Ok(report)
}

fn import_table(
    tx: &Transaction<'_>,
    table: &str,
    rows: &[Record],
    mode: ImportMode,
) -> Result<TableImportStats> {
    let columns = table_columns(tx, table)?;
    let known: HashSet<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    let mut pk: Vec<(i64, &str)> = columns
        .iter()
        .filter(|c| c.pk > 0)
        .map(|c| (c.pk, c.name.as_str()))
        .collect();
    pk.sort_unstable();
    let pk: Vec<&str> = pk.into_iter().map(|(_, name)| name).collect();

    let upsert = mode == ImportMode::Merge && !pk.is_empty();
    let verb = if upsert {
        "INSERT OR REPLACE"
    } else {
        "INSERT OR IGNORE"
    };

    let mut stats = TableImportStats::default();
    let mut dropped = BTreeSet::new();
    // Keyless merge: row content -> (copies stored before import, copies seen in archive)
    let mut duplicates: HashMap<String, (i64, i64)> = HashMap::new();

    for row in rows {
        let mut names = Vec::with_capacity(row.len());
        let mut values = Vec::with_capacity(row.len());
        for (name, value) in row {
            if known.contains(name.as_str()) {
                names.push(quote_identifier(name));
                values.push(json_to_sql(value));
            } else {
                dropped.insert(name.as_str());
            }
        }
        if names.is_empty() {
            stats.skipped += 1;
            continue;
        }

        // Keyless merge: skip only as many copies as were already stored
        if mode == ImportMode::Merge && pk.is_empty() {
            let content = serde_json::to_string(
                &row.iter()
                    .filter(|(name, _)| known.contains(name.as_str()))
                    .collect::<Vec<_>>(),
            )?;
            let entry = match duplicates.entry(content) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    entry.insert((stored_copies(tx, table, row, &known)?, 0))
                }
            };
            entry.1 += 1;
            if entry.1 <= entry.0 {
                stats.skipped += 1;
                continue;
            }
        }

        let existed = upsert && row_exists(tx, table, &pk, row)?;
        let sql = format!(
            "{} INTO {} ({}) VALUES ({})",
            verb,
            quote_identifier(table),
            names.join(", "),
            vec!["?"; names.len()].join(", ")
        );
        let changes = tx.prepare_cached(&sql)?.execute(params_from_iter(values))?;

        if changes == 0 {
            stats.skipped += 1;
        } else if existed {
            stats.updated += 1;
        } else {
            stats.inserted += 1;
        }
    }

    if !dropped.is_empty() {
        warn!(
            table = %table,
            columns = ?dropped,
            "Archive columns missing from target table were dropped"
        );
    }
    debug!(
        table = %table,
        inserted = stats.inserted,
        updated = stats.updated,
        skipped = stats.skipped,
        "Imported table"
    );
    Ok(stats)
}

/// Whether a row with the primary key values of `row` is already stored.
fn row_exists(tx: &Transaction<'_>, table: &str, pk: &[&str], row: &Record) -> Result<bool> {
    let mut values = Vec::with_capacity(pk.len());
    for column in pk {
        match row.get(*column) {
            Some(value) if !value.is_null() => values.push(json_to_sql(value)),
            _ => return Ok(false),
        }
    }

    let predicate = pk
        .iter()
        .map(|c| format!("{} = ?", quote_identifier(c)))
        .collect::<Vec<_>>()
        .join(" AND ");
    let sql = format!(
        "SELECT EXISTS(SELECT 1 FROM {} WHERE {})",
        quote_identifier(table),
        predicate
    );
    let exists: bool = tx
        .prepare_cached(&sql)?
        .query_row(params_from_iter(values), |r| r.get(0))?;
    Ok(exists)
}

/// Number of stored rows whose known columns all match `row`.
fn stored_copies(
    tx: &Transaction<'_>,
    table: &str,
    row: &Record,
    known: &HashSet<&str>,
) -> Result<i64> {
    let mut predicate = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());
    for (name, value) in row {
        if known.contains(name.as_str()) {
            predicate.push(format!("{} IS ?", quote_identifier(name)));
            values.push(json_to_sql(value));
        }
    }

    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE {}",
        quote_identifier(table),
        predicate.join(" AND ")
    );
    let copies: i64 = tx
        .prepare_cached(&sql)?
        .query_row(params_from_iter(values), |r| r.get(0))?;
    Ok(copies)
}

/// [`export_encrypted`] on the blocking pool
pub async fn export_encrypted_async(db_path: PathBuf, password: String) -> Result<Vec<u8>> {
    let password = Zeroizing::new(password);
    run_blocking(move || export_encrypted(&db_path, &password)).await
}

/// [`import_encrypted`] on the blocking pool
pub async fn import_encrypted_async(
    archive: Vec<u8>,
    password: String,
    target: PathBuf,
    mode: ImportMode,
) -> Result<ImportReport> {
    let password = Zeroizing::new(password);
    run_blocking(move || import_encrypted(&archive, &password, &target, mode)).await
}
