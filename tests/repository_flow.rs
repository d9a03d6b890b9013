use std::{sync::Arc, time::Duration};

use doc_repository::{
    db,
    errors::RepositoryError,
    models::{FileKey, InsertOptions, RepoQueryParams, UpdateOptions, document::doc},
    services::{
        blob_store::DiskBlobStore,
        document_store::{DocumentStore, SqliteDocumentStore},
        file_storage::FileStorage,
        repository::Repository,
    },
};
use serde_json::json;
use tempfile::tempdir;

const BUCKET: &str = "my_file_bucket";

async fn services(root: &std::path::Path) -> (Repository, FileStorage) {
    let url = format!("sqlite://{}", root.join("meta/repository.db").display());
    let pool = db::connect(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    let store: Arc<dyn DocumentStore> = Arc::new(SqliteDocumentStore::new(Arc::new(pool)));
    let repository = Repository::new(store.clone());
    let blobs = Arc::new(DiskBlobStore::new(store, root.join("blobs")));
    let files = FileStorage::new(repository.clone(), blobs, BUCKET);
    (repository, files)
}

#[tokio::test]
async fn documents_survive_reconnect() {
    let dir = tempdir().unwrap();
    let id = {
        let (repo, _) = services(dir.path()).await;
        let saved = repo
            .insert_one(
                "users",
                json!({"name": "Ada Lovelace", "email": "ada@example.com"}),
                &InsertOptions::default(),
            )
            .await
            .unwrap();
        let err = repo
            .insert_one(
                "users",
                json!({"name": "Someone Else", "email": "ada@example.com"}),
                &InsertOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::DuplicateEmail));
        saved["id"].as_str().unwrap().to_string()
    };

    let (repo, _) = services(dir.path()).await;
    let filter = doc(json!({ "_id": id }));
    let updated = repo
        .update_one(
            "users",
            &filter,
            doc(json!({"role": "admin"})),
            &UpdateOptions::default(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated["name"], json!("ada_lovelace"));
    assert_eq!(updated["role"], json!("admin"));

    assert!(repo.exists("users", &doc(json!({"role": "admin"}))).await.unwrap());
    let all = repo
        .get_many("users", &RepoQueryParams::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn file_lifecycle_with_cache() {
    let dir = tempdir().unwrap();
    let (_, files) = services(dir.path()).await;
    let cache_root = dir.path().join("cache");

    let src = dir.path().join("upload.csv");
    tokio::fs::write(&src, b"a,b\n1,2\n").await.unwrap();
    let record = files
        .create_file_from_path(
            &src,
            "exports/data.csv?download=1",
            Some(doc(json!({"source": "nightly"}))),
            files.default_bucket(),
        )
        .await
        .unwrap();
    assert_eq!(record.filename, "exports/data.csv");
    assert_eq!(record.extra.get("source"), Some(&json!("nightly")));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let query = FileKey::ByFilename("exports/data.csv".into()).to_filter();
    let local = files.get_file_data(&query, &cache_root, BUCKET).await.unwrap();
    assert_eq!(tokio::fs::read(&local).await.unwrap(), b"a,b\n1,2\n");
    let again = files.get_file_data(&query, &cache_root, BUCKET).await.unwrap();
    assert_eq!(local, again);

    let renamed = files
        .rename_file(&record.id, "exports/archive/data.csv", BUCKET)
        .await
        .unwrap();
    assert_eq!(renamed.extra.get("source"), Some(&json!("nightly")));
    assert!(matches!(
        files.get_file_data(&query, &cache_root, BUCKET).await,
        Err(RepositoryError::FileNotFound(_))
    ));

    assert!(files.delete_file(&record.id, BUCKET).await.unwrap().deleted);
    assert!(
        files
            .get_one_file_info(&FileKey::ById(record.id).to_filter(), BUCKET)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_updates_on_file_database_all_succeed() {
    let dir = tempdir().unwrap();
    let (repo, _) = services(dir.path()).await;
    let saved = repo
        .insert_one("counters", json!({"name": "hits"}), &InsertOptions::default())
        .await
        .unwrap();
    let filter = doc(json!({ "_id": saved["id"].clone() }));

    let mut tasks = Vec::new();
    for round in 0..80 {
        let repo = repo.clone();
        let filter = filter.clone();
        tasks.push(tokio::spawn(async move {
            repo.update_one(
                "counters",
                &filter,
                doc(json!({ "round": round })),
                &UpdateOptions::default(),
            )
            .await
        }));
    }

    let mut failures = Vec::new();
    for task in tasks {
        if let Err(err) = task.await.unwrap() {
            failures.push(err.to_string());
        }
    }
    assert!(failures.is_empty(), "failed updates: {:?}", failures);

    let current = repo
        .get_one("counters", &filter, &Default::default())
        .await
        .unwrap()
        .unwrap();
    assert!(current["round"].is_number());
}
