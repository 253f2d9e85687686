use lanestore_core::{
    attributes, AttributeDescription, EntityDescription, ErrorCode, FetchRequest,
    PersistenceStack, SchemaDescriptor, SchemaSource, StackError, StackOptions, StoreKind,
};
use std::path::Path;

fn notes_schema() -> SchemaDescriptor {
    SchemaDescriptor::new("Notes", 1).with_entity(
        EntityDescription::new("Note")
            .with_attribute(AttributeDescription::text("title").required())
            .with_attribute(AttributeDescription::text("body")),
    )
}

fn write_model(dir: &Path, file_name: &str, schema: &SchemaDescriptor) {
    let json = serde_json::to_string_pretty(schema).unwrap();
    std::fs::write(dir.join(file_name), json).unwrap();
}

#[test]
fn missing_model_reports_model_not_found_code() {
    let dir = tempfile::tempdir().unwrap();
    let options = StackOptions::new(
        StoreKind::InMemory,
        SchemaSource::ModelFile(dir.path().join("Missing.json")),
    );

    let err = PersistenceStack::open(options).unwrap_err();
    assert!(matches!(err, StackError::SchemaNotFound(_)));
    assert_eq!(err.code(), Some(ErrorCode::ManagedObjectModelNotFound));
    assert_eq!(err.code().map(|code| code as u32), Some(2));
    assert_eq!(err.domain(), "lanestore.stack");
}

#[test]
fn malformed_model_is_a_schema_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("Broken.json"), "{ not json").unwrap();
    let options = StackOptions::new(
        StoreKind::InMemory,
        SchemaSource::ModelFile(dir.path().join("Broken.json")),
    );

    let err = PersistenceStack::open(options).unwrap_err();
    assert!(matches!(err, StackError::Schema(_)));
    assert_eq!(err.code(), None);
}

#[test]
fn on_disk_store_without_url_is_rejected() {
    let options = StackOptions::new(StoreKind::Sqlite, SchemaSource::Descriptor(notes_schema()));
    assert!(matches!(
        PersistenceStack::open(options),
        Err(StackError::InvalidConfig(_))
    ));
}

#[test]
fn fresh_store_is_stamped_with_loaded_schema() {
    let stack = PersistenceStack::open(StackOptions::in_memory(notes_schema())).unwrap();
    assert!(!stack.requires_migration());
    assert_eq!(stack.store().kind(), StoreKind::InMemory);
    assert_eq!(stack.store().stamped_version(), 1);
    assert_eq!(stack.registry().entity_names(), vec!["Note"]);
}

#[test]
fn sqlite_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let url = dir.path().join("data").join("notes.sqlite3");
    let options = || {
        StackOptions::new(StoreKind::Sqlite, SchemaSource::Descriptor(notes_schema()))
            .with_store_url(&url)
    };

    {
        let stack = PersistenceStack::open(options()).unwrap();
        stack
            .create("Note", attributes! { "title" => "kept", "body" => "on disk" })
            .unwrap();
        assert!(stack.save().unwrap());
        stack.close().unwrap();
    }
    assert!(url.exists());

    let stack = PersistenceStack::open(options()).unwrap();
    assert_eq!(stack.store().url(), Some(url.as_path()));
    let notes = stack.fetch(&FetchRequest::new("Note")).unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].text("body"), Some("on disk"));
}

#[test]
fn binary_store_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let url = dir.path().join("notes.store");
    let options = || {
        StackOptions::new(StoreKind::Binary, SchemaSource::Descriptor(notes_schema()))
            .with_store_url(&url)
    };

    {
        let stack = PersistenceStack::open(options()).unwrap();
        stack.create("Note", attributes! { "title" => "bin" }).unwrap();
        stack.save().unwrap();
        stack.close().unwrap();
    }

    let stack = PersistenceStack::open(options()).unwrap();
    assert_eq!(stack.count(&FetchRequest::new("Note")).unwrap(), 1);
}

#[test]
fn bundle_model_is_resolved_by_name() {
    let dir = tempfile::tempdir().unwrap();
    write_model(dir.path(), "Notes.json", &notes_schema());

    let options = StackOptions::new(
        StoreKind::InMemory,
        SchemaSource::Bundle {
            dir: dir.path().to_path_buf(),
            model_name: "Notes".to_string(),
        },
    );
    let stack = PersistenceStack::open(options).unwrap();
    assert_eq!(stack.store().schema().name, "Notes");
    assert!(stack.registry().contains("Note"));
}

#[test]
fn stack_opens_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("models")).unwrap();
    write_model(&dir.path().join("models"), "Notes.json", &notes_schema());
    std::fs::write(
        dir.path().join("stack.json"),
        r#"{
            "store_kind": "sqlite",
            "store_url": "notes.sqlite3",
            "bundle_dir": "models",
            "model_name": "Notes"
        }"#,
    )
    .unwrap();

    let stack = PersistenceStack::from_config_file(dir.path().join("stack.json")).unwrap();
    assert_eq!(stack.store().kind(), StoreKind::Sqlite);
    assert_eq!(
        stack.store().url(),
        Some(dir.path().join("notes.sqlite3").as_path())
    );
}

#[test]
fn closed_store_refuses_operations() {
    let stack = PersistenceStack::open(StackOptions::in_memory(notes_schema())).unwrap();
    stack.create("Note", attributes! { "title" => "late" }).unwrap();

    stack.close().unwrap();
    stack.close().unwrap();
    assert!(stack.store().is_closed());

    assert!(matches!(
        stack.fetch(&FetchRequest::new("Note")),
        Err(StackError::StoreClosed)
    ));
    assert!(matches!(stack.save(), Err(StackError::StoreClosed)));
    assert!(matches!(stack.migrate(), Err(StackError::StoreClosed)));
}
