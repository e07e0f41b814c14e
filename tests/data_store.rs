mod common;

use std::sync::Arc;

use serde_json::{json, Value};

use common::READINGS_SCHEMA;
use sensorlink_lib::store::{
    Database, DecryptPolicy, FieldCipher, Operator, Predicate, QueryFilter, QueryOptions, Record, SortDirection,
    StoreError,
};

fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}

async fn open(policy: DecryptPolicy) -> (Database, Arc<FieldCipher>) {
    let cipher = Arc::new(FieldCipher::from_secret("store-test"));
    let db = Database::open_in_memory(Arc::clone(&cipher), policy).unwrap();
    db.execute_batch(READINGS_SCHEMA).await.unwrap();
    (db, cipher)
}

async fn seed(db: &Database) {
    for (user, device, humidity) in [
        ("u1", "A1", 40.0),
        ("u2", "B2", 41.0),
        ("u1", "A1", 42.0),
        ("u3", "A1", 43.0),
        ("u2", "B2", 44.0),
    ] {
        db.insert(
            "sensor_readings",
            &record(json!({"user_id": user, "device_id": device, "humidity": humidity})),
        )
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn test_insert_returns_row_ids() {
    let (db, _) = open(DecryptPolicy::default()).await;
    let first = db.insert("sensor_readings", &record(json!({"device_id": "A1"}))).await.unwrap();
    let second = db.insert("sensor_readings", &record(json!({"device_id": "A1"}))).await.unwrap();
    assert_eq!(first, 1);
    assert_eq!(second, 2);
}

#[tokio::test]
async fn test_select_filters_orders_and_limits() {
    let (db, _) = open(DecryptPolicy::default()).await;
    seed(&db).await;

    let filters = record(json!({"device_id": "A1"}));
    let options: QueryOptions = serde_json::from_value(json!({"orderBy": "id DESC", "limit": 2})).unwrap();
    let rows = db.select("sensor_readings", &filters, &options).await.unwrap();

    assert!(rows.len() <= 2);
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r["device_id"] == json!("A1")));
    let ids: Vec<i64> = rows.iter().map(|r| r["id"].as_i64().unwrap()).collect();
    assert_eq!(ids, vec![4, 3]);
}

#[tokio::test]
async fn test_select_defaults_to_descending() {
    let (db, _) = open(DecryptPolicy::default()).await;
    seed(&db).await;

    let options = QueryOptions::new().order_by("humidity", SortDirection::parse("upwards"));
    let rows = db.select("sensor_readings", &QueryFilter::new(), &options).await.unwrap();
    let humidity: Vec<f64> = rows.iter().map(|r| r["humidity"].as_f64().unwrap()).collect();
    assert_eq!(humidity, vec![44.0, 43.0, 42.0, 41.0, 40.0]);
}

#[tokio::test]
async fn test_invalid_limit_is_ignored() {
    let (db, _) = open(DecryptPolicy::default()).await;
    seed(&db).await;

    let options: QueryOptions = serde_json::from_value(json!({"limit": -1})).unwrap();
    let rows = db.select("sensor_readings", &QueryFilter::new(), &options).await.unwrap();
    assert_eq!(rows.len(), 5);
}

#[tokio::test]
async fn test_update_and_delete_with_predicates() {
    let (db, _) = open(DecryptPolicy::default()).await;
    seed(&db).await;

    let changed = db
        .update(
            "sensor_readings",
            &record(json!({"user_id": "moved"})),
            &[Predicate::eq("device_id", "B2"), Predicate::new("humidity", Operator::Gt, 41.5)],
        )
        .await
        .unwrap();
    assert_eq!(changed, 1);

    let deleted = db
        .delete("sensor_readings", &[Predicate::new("humidity", Operator::Lte, 41.0)])
        .await
        .unwrap();
    assert_eq!(deleted, 2);

    let rows = db
        .select("sensor_readings", &record(json!({"user_id": "moved"})), &QueryOptions::new())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["humidity"], json!(44.0));
}

#[tokio::test]
async fn test_identifiers_cannot_inject() {
    let (db, _) = open(DecryptPolicy::default()).await;
    seed(&db).await;

    let result = db
        .delete("sensor_readings", &[Predicate::eq("1=1 OR device_id", "x")])
        .await;
    assert!(matches!(result, Err(StoreError::Sqlite(_))), "unknown column must fail");

    let rows = db.select("sensor_readings", &QueryFilter::new(), &QueryOptions::new()).await.unwrap();
    assert_eq!(rows.len(), 5);
}

#[tokio::test]
async fn test_empty_inputs_are_rejected() {
    let (db, _) = open(DecryptPolicy::default()).await;
    assert!(matches!(
        db.insert("sensor_readings", &Record::new()).await,
        Err(StoreError::InvalidInput(_))
    ));
    assert!(matches!(
        db.delete("sensor_readings", &[]).await,
        Err(StoreError::InvalidInput(_))
    ));
    assert!(matches!(
        db.update("sensor_readings", &record(json!({"a": 1})), &[]).await,
        Err(StoreError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_declared_columns_decrypt_with_numeric_coercion() {
    let (db, cipher) = open(DecryptPolicy::declared("sensor_readings", ["temperature_reading"])).await;

    let stored = cipher.encrypt("23.5").unwrap();
    db.insert(
        "sensor_readings",
        &record(json!({"temperature_reading": stored, "user_id": cipher.encrypt("u1").unwrap()})),
    )
    .await
    .unwrap();

    let rows = db.select("sensor_readings", &QueryFilter::new(), &QueryOptions::new()).await.unwrap();
    assert_eq!(rows[0]["temperature_reading"], json!(23.5));
    // Not declared, left as stored
    assert!(rows[0]["user_id"].as_str().unwrap().contains(':'));
}

#[tokio::test]
async fn test_opportunistic_probe_decrypts_any_column() {
    let (db, cipher) = open(DecryptPolicy::Opportunistic).await;

    db.insert(
        "sensor_readings",
        &record(json!({
            "user_id": cipher.encrypt("u1").unwrap(),
            "device_id": "12:30",
            "temperature_reading": "plain"
        })),
    )
    .await
    .unwrap();

    let rows = db.select("sensor_readings", &QueryFilter::new(), &QueryOptions::new()).await.unwrap();
    assert_eq!(rows[0]["user_id"], json!("u1"));
    assert_eq!(rows[0]["device_id"], json!("12:30"), "undecryptable values pass through");
    assert_eq!(rows[0]["temperature_reading"], json!("plain"));
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (db, _) = open(DecryptPolicy::default()).await;
    db.ping().await.unwrap();
    db.close();
    db.close();
    assert!(matches!(
        db.insert("sensor_readings", &record(json!({"device_id": "A1"}))).await,
        Err(StoreError::Closed)
    ));
}
