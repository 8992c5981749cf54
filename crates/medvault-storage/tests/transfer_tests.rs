//! Portable export/import tests
//!
//! Tests cover:
//! - End-to-end export with the correct and a wrong password
//! - Merge idempotence and replace destructiveness
//! - Transactional rollback on a bad archive table
//! - Empty tables, BLOB columns and encrypted columns surviving transfer

use medvault_storage::{
    export_encrypted, export_encrypted_async, import_encrypted, import_encrypted_async,
    FieldCipher, HexSecret, ImportMode, RecordCodec, RecordKind, TableImportStats,
    WRONG_PASSWORD_MESSAGE,
};
use medvault_storage::database::{insert_record, query_records};
use rusqlite::Connection;
use serde_json::json;
use std::path::{Path, PathBuf};

const PASSWORD: &str = "correct-horse-battery";
const WRONG_PASSWORD: &str = "wrong-password";

const SCHEMA: &str = "
    CREATE TABLE patients (id INTEGER PRIMARY KEY, name TEXT, diagnosis TEXT);
    CREATE TABLE treatments (id INTEGER PRIMARY KEY, patient_id INTEGER, treatment_name TEXT);
    CREATE TABLE symptom_log (day TEXT, severity INTEGER, attachment BLOB);
";

fn empty_db(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    Connection::open(&path).unwrap().execute_batch(SCHEMA).unwrap();
    path
}

/// 3 tables, 10 rows
fn seeded_db(dir: &Path, name: &str) -> PathBuf {
    let path = empty_db(dir, name);
    Connection::open(&path)
        .unwrap()
        .execute_batch(
            "INSERT INTO patients VALUES (1, 'Ada', 'PDAC'), (2, 'Grace', 'NSCLC'), (3, 'Alan', 'GBM');
             INSERT INTO treatments VALUES (1, 1, 'FOLFIRINOX'), (2, 1, 'Gemcitabine'),
                                           (3, 2, 'Osimertinib'), (4, 3, 'Temozolomide');
             INSERT INTO symptom_log VALUES ('2024-05-01', 3, X'00FF10'),
                                            ('2024-05-02', 2, NULL),
                                            ('2024-05-03', 4, X'CAFE');",
        )
        .unwrap();
    path
}

fn count(path: &Path, table: &str) -> i64 {
    Connection::open(path)
        .unwrap()
        .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
        .unwrap()
}

fn dump(path: &Path) -> Vec<String> {
    let conn = Connection::open(path).unwrap();
    let mut rows = Vec::new();
    for table in ["patients", "treatments", "symptom_log"] {
        for record in query_records(&conn, &format!("SELECT * FROM {} ORDER BY rowid", table), [])
            .unwrap()
        {
            rows.push(format!("{}:{}", table, serde_json::Value::Object(record)));
        }
    }
    rows
}

// =============================================================================
// End to End
// =============================================================================

#[test]
fn test_end_to_end_wrong_then_correct_password() {
    let dir = tempfile::tempdir().unwrap();
    let source = seeded_db(dir.path(), "source.db");
    let target = empty_db(dir.path(), "target.db");

    let archive = export_encrypted(&source, PASSWORD).unwrap();
    assert!(!String::from_utf8_lossy(&archive).contains("FOLFIRINOX"));

    let err = import_encrypted(&archive, WRONG_PASSWORD, &target, ImportMode::Merge).unwrap_err();
    assert!(err.is_authentication_failure());
    assert_eq!(err.to_string(), WRONG_PASSWORD_MESSAGE);
    assert_eq!(count(&target, "patients"), 0);

    let report = import_encrypted(&archive, PASSWORD, &target, ImportMode::Merge).unwrap();
    assert_eq!(report.mode, ImportMode::Merge);
    assert_eq!(report.total_inserted, 10);
    assert_eq!(report.total_updated, 0);
    assert_eq!(report.total_skipped, 0);
    assert_eq!(report.tables["treatments"].inserted, 4);

    assert_eq!(dump(&target), dump(&source));
}

#[test]
fn test_tampered_archive_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let source = seeded_db(dir.path(), "source.db");
    let target = empty_db(dir.path(), "target.db");

    let mut archive = export_encrypted(&source, PASSWORD).unwrap();
    let last = archive.len() - 1;
    archive[last] ^= 0x01;

    let err = import_encrypted(&archive, PASSWORD, &target, ImportMode::Merge).unwrap_err();
    assert_eq!(err.to_string(), WRONG_PASSWORD_MESSAGE);
}

#[test]
fn test_short_password_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let source = seeded_db(dir.path(), "source.db");
    let err = export_encrypted(&source, "1234567").unwrap_err();
    assert!(matches!(err, medvault_storage::Error::Validation(_)));
}

// =============================================================================
// Merge and Replace
// =============================================================================

#[test]
fn test_merge_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let source = seeded_db(dir.path(), "source.db");
    let target = empty_db(dir.path(), "target.db");
    let archive = export_encrypted(&source, PASSWORD).unwrap();

    import_encrypted(&archive, PASSWORD, &target, ImportMode::Merge).unwrap();
    let after_first = dump(&target);

    let second = import_encrypted(&archive, PASSWORD, &target, ImportMode::Merge).unwrap();
    assert_eq!(dump(&target), after_first);
    assert_eq!(second.total_inserted, 0);
    assert_eq!(
        second.tables["patients"],
        TableImportStats {
            inserted: 0,
            updated: 3,
            skipped: 0
        }
    );
    assert_eq!(second.total_updated, 7);
    assert_eq!(second.tables["symptom_log"].skipped, 3);
}

#[test]
fn test_merge_keeps_duplicate_rows_in_keyless_table() {
    let dir = tempfile::tempdir().unwrap();
    let dose_log = "CREATE TABLE dose_log (day TEXT, med TEXT);";
    let source = dir.path().join("source.db");
    Connection::open(&source)
        .unwrap()
        .execute_batch(
            "CREATE TABLE dose_log (day TEXT, med TEXT);
             INSERT INTO dose_log VALUES ('2024-05-01', 'LDN'), ('2024-05-01', 'LDN'),
                                         ('2024-05-02', 'LDN');",
        )
        .unwrap();
    let archive = export_encrypted(&source, PASSWORD).unwrap();

    let target = dir.path().join("target.db");
    Connection::open(&target).unwrap().execute_batch(dose_log).unwrap();

    let first = import_encrypted(&archive, PASSWORD, &target, ImportMode::Merge).unwrap();
    assert_eq!(
        first.tables["dose_log"],
        TableImportStats {
            inserted: 3,
            updated: 0,
            skipped: 0
        }
    );
    assert_eq!(count(&target, "dose_log"), 3);

    let second = import_encrypted(&archive, PASSWORD, &target, ImportMode::Merge).unwrap();
    assert_eq!(
        second.tables["dose_log"],
        TableImportStats {
            inserted: 0,
            updated: 0,
            skipped: 3
        }
    );
    assert_eq!(count(&target, "dose_log"), 3);

    // One copy already stored locally: only the missing copy is added
    let partial = dir.path().join("partial.db");
    Connection::open(&partial)
        .unwrap()
        .execute_batch(
            "CREATE TABLE dose_log (day TEXT, med TEXT);
             INSERT INTO dose_log VALUES ('2024-05-01', 'LDN');",
        )
        .unwrap();
    let report = import_encrypted(&archive, PASSWORD, &partial, ImportMode::Merge).unwrap();
    assert_eq!(
        report.tables["dose_log"],
        TableImportStats {
            inserted: 2,
            updated: 0,
            skipped: 1
        }
    );
    assert_eq!(count(&partial, "dose_log"), 3);
}

#[test]
fn test_merge_keeps_rows_missing_from_archive() {
    let dir = tempfile::tempdir().unwrap();
    let source = seeded_db(dir.path(), "source.db");
    let target = empty_db(dir.path(), "target.db");
    Connection::open(&target)
        .unwrap()
        .execute_batch("INSERT INTO patients VALUES (1, 'Old Ada', 'unknown'), (9, 'Local', 'CRC');")
        .unwrap();

    let archive = export_encrypted(&source, PASSWORD).unwrap();
    let report = import_encrypted(&archive, PASSWORD, &target, ImportMode::Merge).unwrap();
    assert_eq!(report.tables["patients"].updated, 1);
    assert_eq!(report.tables["patients"].inserted, 2);

    let conn = Connection::open(&target).unwrap();
    let name: String = conn
        .query_row("SELECT name FROM patients WHERE id = 1", [], |r| r.get(0))
        .unwrap();
    assert_eq!(name, "Ada");
    assert_eq!(count(&target, "patients"), 4);
}

#[test]
fn test_replace_discards_existing_rows() {
    let dir = tempfile::tempdir().unwrap();
    let source = seeded_db(dir.path(), "source.db");
    let target = empty_db(dir.path(), "target.db");
    Connection::open(&target)
        .unwrap()
        .execute_batch(
            "INSERT INTO patients VALUES (9, 'Local', 'CRC');
             INSERT INTO symptom_log VALUES ('2023-01-01', 1, NULL);",
        )
        .unwrap();

    let archive = export_encrypted(&source, PASSWORD).unwrap();
    let report = import_encrypted(&archive, PASSWORD, &target, ImportMode::Replace).unwrap();
    assert_eq!(report.mode, ImportMode::Replace);
    assert_eq!(report.total_inserted, 10);

    assert_eq!(dump(&target), dump(&source));
    assert_eq!(count(&target, "patients"), 3);
}

#[test]
fn test_missing_target_table_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let source = seeded_db(dir.path(), "source.db");
    let target = dir.path().join("partial.db");
    Connection::open(&target)
        .unwrap()
        .execute_batch(
            "CREATE TABLE patients (id INTEGER PRIMARY KEY, name TEXT, diagnosis TEXT);
             CREATE TABLE treatments (id INTEGER PRIMARY KEY, patient_id INTEGER, treatment_name TEXT);
             INSERT INTO patients VALUES (9, 'Local', 'CRC');",
        )
        .unwrap();

    let archive = export_encrypted(&source, PASSWORD).unwrap();
    let err = import_encrypted(&archive, PASSWORD, &target, ImportMode::Replace).unwrap_err();
    assert!(matches!(err, medvault_storage::Error::Validation(_)));
    assert!(err.to_string().contains("symptom_log"));

    assert_eq!(count(&target, "patients"), 1);
    assert_eq!(count(&target, "treatments"), 0);
}

#[test]
fn test_failed_merge_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let source = seeded_db(dir.path(), "source.db");
    let target = dir.path().join("strict.db");
    Connection::open(&target)
        .unwrap()
        .execute_batch(
            "CREATE TABLE patients (id INTEGER PRIMARY KEY, name TEXT CHECK (name <> 'Alan'), diagnosis TEXT);
             CREATE TABLE treatments (id INTEGER PRIMARY KEY, patient_id INTEGER, treatment_name TEXT);
             CREATE TABLE symptom_log (day TEXT, severity INTEGER, attachment BLOB);
             INSERT INTO patients VALUES (9, 'Local', 'CRC');",
        )
        .unwrap();

    let archive = export_encrypted(&source, PASSWORD).unwrap();
    let err = import_encrypted(&archive, PASSWORD, &target, ImportMode::Merge).unwrap_err();
    assert!(matches!(err, medvault_storage::Error::Database(_)));

    assert_eq!(count(&target, "patients"), 1);
    assert_eq!(count(&target, "treatments"), 0);
}

#[test]
fn test_empty_tables_are_skipped_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.db");
    Connection::open(&source)
        .unwrap()
        .execute_batch(
            "CREATE TABLE patients (id INTEGER PRIMARY KEY, name TEXT, diagnosis TEXT);
             CREATE TABLE audit_trail (id INTEGER PRIMARY KEY, event TEXT);
             INSERT INTO patients VALUES (1, 'Ada', 'PDAC');",
        )
        .unwrap();
    let target = empty_db(dir.path(), "target.db");

    let archive = export_encrypted(&source, PASSWORD).unwrap();
    let report = import_encrypted(&archive, PASSWORD, &target, ImportMode::Merge).unwrap();
    assert_eq!(report.tables["audit_trail"], TableImportStats::default());
    assert_eq!(report.tables["patients"].inserted, 1);
}

// =============================================================================
// Column Content
// =============================================================================

#[test]
fn test_blob_and_encrypted_columns_survive() {
    let dir = tempfile::tempdir().unwrap();
    let source = seeded_db(dir.path(), "source.db");
    let codec = RecordCodec::new(FieldCipher::new(HexSecret::generate("DB_ENCRYPTION_KEY")));

    let treatment = json!({ "id": 10, "patient_id": 2, "treatment_name": "Pembrolizumab" })
        .as_object()
        .cloned()
        .unwrap();
    let encrypted = codec.encrypt_record(RecordKind::Treatment, &treatment).unwrap();
    insert_record(&Connection::open(&source).unwrap(), "treatments", &encrypted).unwrap();

    let target = empty_db(dir.path(), "target.db");
    let archive = export_encrypted(&source, PASSWORD).unwrap();
    import_encrypted(&archive, PASSWORD, &target, ImportMode::Merge).unwrap();

    let conn = Connection::open(&target).unwrap();
    let blob: Vec<u8> = conn
        .query_row("SELECT attachment FROM symptom_log WHERE day = '2024-05-03'", [], |r| r.get(0))
        .unwrap();
    assert_eq!(blob, vec![0xCA, 0xFE]);

    let rows = query_records(&conn, "SELECT * FROM treatments WHERE id = 10", []).unwrap();
    assert_eq!(rows[0]["treatment_name"], encrypted["treatment_name"]);
    assert_eq!(codec.decrypt_record(RecordKind::Treatment, &rows[0]), treatment);
}

#[tokio::test]
async fn test_async_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let source = seeded_db(dir.path(), "source.db");
    let target = empty_db(dir.path(), "target.db");

    let archive = export_encrypted_async(source.clone(), PASSWORD.to_string())
        .await
        .unwrap();
    let report = import_encrypted_async(archive, PASSWORD.to_string(), target.clone(), ImportMode::default())
        .await
        .unwrap();
    assert_eq!(report.total_inserted, 10);
    assert_eq!(dump(&target), dump(&source));
}
