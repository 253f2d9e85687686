use lanestore_core::{
    attributes, AttributeDescription, EntityDescription, ErrorCode, FetchRequest, MappingModel,
    MigrationError, MigrationPolicy, PersistenceStack, SchemaDescriptor, SchemaSource,
    StackError, StackOptions, StoreKind,
};
use std::path::Path;

fn notes_v1() -> SchemaDescriptor {
    SchemaDescriptor::new("Notes", 1).with_entity(
        EntityDescription::new("Note")
            .with_attribute(AttributeDescription::text("title").required())
            .with_attribute(AttributeDescription::text("body")),
    )
}

fn notes_v2() -> SchemaDescriptor {
    SchemaDescriptor::new("Notes", 2)
        .with_entity(
            EntityDescription::new("Note")
                .with_attribute(AttributeDescription::text("title").required())
                .with_attribute(AttributeDescription::text("body"))
                .with_attribute(AttributeDescription::integer("priority").with_default(0)),
        )
        .with_entity(
            EntityDescription::new("Tag")
                .with_attribute(AttributeDescription::text("name").required().unique()),
        )
}

fn sqlite_options(url: &Path, schema: SchemaDescriptor) -> StackOptions {
    StackOptions::new(StoreKind::Sqlite, SchemaSource::Descriptor(schema)).with_store_url(url)
}

/// Creates a v1 store at `url` holding the given notes.
fn seed_v1(url: &Path, notes: &[(&str, Option<&str>)]) {
    let stack = PersistenceStack::open(sqlite_options(url, notes_v1())).unwrap();
    for (title, body) in notes {
        let mut attrs = attributes! { "title" => *title };
        if let Some(body) = body {
            attrs.insert("body".to_string(), (*body).into());
        }
        stack.create("Note", attrs).unwrap();
    }
    stack.save().unwrap();
    stack.close().unwrap();
}

#[test]
fn manual_policy_blocks_data_operations_until_migrated() {
    let dir = tempfile::tempdir().unwrap();
    let url = dir.path().join("notes.sqlite3");
    seed_v1(&url, &[("first", Some("kept"))]);

    let stack = PersistenceStack::open(sqlite_options(&url, notes_v2())).unwrap();
    assert!(stack.requires_migration());
    assert_eq!(stack.store().stamped_version(), 1);
    assert!(matches!(
        stack.fetch(&FetchRequest::new("Note")),
        Err(StackError::MigrationRequired)
    ));
    stack.create("Tag", attributes! { "name" => "early" }).unwrap();
    assert!(matches!(stack.save(), Err(StackError::MigrationRequired)));
    stack.rollback_in(lanestore_core::ContextKind::Write).unwrap();

    stack.migrate().unwrap();
    assert!(!stack.requires_migration());
    assert_eq!(stack.store().stamped_version(), 2);
    stack.migrate().unwrap();

    let notes = stack.fetch(&FetchRequest::new("Note")).unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].text("body"), Some("kept"));
    assert_eq!(notes[0].integer("priority"), Some(0));

    stack.create("Tag", attributes! { "name" => "work" }).unwrap();
    assert!(stack.save().unwrap());
    assert_eq!(stack.count(&FetchRequest::new("Tag")).unwrap(), 1);
}

#[test]
fn automatic_policy_migrates_at_open() {
    let dir = tempfile::tempdir().unwrap();
    let url = dir.path().join("notes.sqlite3");
    seed_v1(&url, &[("first", None)]);

    let stack = PersistenceStack::open(
        sqlite_options(&url, notes_v2()).with_migration_policy(MigrationPolicy::Automatic),
    )
    .unwrap();
    assert!(!stack.requires_migration());
    assert_eq!(stack.count(&FetchRequest::new("Note")).unwrap(), 1);
}

#[test]
fn kind_change_without_mapping_is_reported_with_code_one() {
    let dir = tempfile::tempdir().unwrap();
    let url = dir.path().join("notes.sqlite3");
    seed_v1(&url, &[("first", Some("text"))]);

    let retyped = SchemaDescriptor::new("Notes", 2).with_entity(
        EntityDescription::new("Note")
            .with_attribute(AttributeDescription::text("title").required())
            .with_attribute(AttributeDescription::integer("body")),
    );

    let stack = PersistenceStack::open(sqlite_options(&url, retyped.clone())).unwrap();
    let err = stack.migrate().unwrap_err();
    assert!(matches!(
        err,
        StackError::Migration(MigrationError::MappingModelNotFound {
            source_version: 1,
            destination_version: 2,
            ..
        })
    ));
    assert_eq!(err.code(), Some(ErrorCode::MappingModelNotFound));
    assert!(stack.requires_migration());
    assert_eq!(stack.store().stamped_version(), 1);
    stack.close().unwrap();
    drop(stack);

    let err = PersistenceStack::open(
        sqlite_options(&url, retyped).with_migration_policy(MigrationPolicy::Automatic),
    )
    .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::MappingModelNotFound));
}

#[test]
fn downgrade_without_mapping_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let url = dir.path().join("notes.sqlite3");
    {
        let stack = PersistenceStack::open(
            sqlite_options(&url, notes_v2()).with_migration_policy(MigrationPolicy::Automatic),
        )
        .unwrap();
        stack.close().unwrap();
    }

    let stack = PersistenceStack::open(sqlite_options(&url, notes_v1())).unwrap();
    assert!(stack.requires_migration());
    assert_eq!(
        stack.migrate().unwrap_err().code(),
        Some(ErrorCode::MappingModelNotFound)
    );
}

fn memos_v2() -> SchemaDescriptor {
    SchemaDescriptor::new("Notes", 2).with_entity(
        EntityDescription::new("Memo")
            .with_attribute(AttributeDescription::text("heading").required())
            .with_attribute(AttributeDescription::text("body")),
    )
}

fn memo_mapping() -> MappingModel {
    MappingModel::new(1, 2)
        .rename_entity("Note", "Memo")
        .rename_attribute("Memo", "title", "heading")
}

#[test]
fn inline_mapping_renames_entity_and_attribute() {
    let dir = tempfile::tempdir().unwrap();
    let url = dir.path().join("notes.sqlite3");
    seed_v1(&url, &[("renamed", Some("same body"))]);

    let stack = PersistenceStack::open(
        sqlite_options(&url, memos_v2()).with_mapping_model(memo_mapping()),
    )
    .unwrap();
    stack.migrate().unwrap();

    let memos = stack
        .fetch(&FetchRequest::new("Memo").filter(r#"heading == "renamed""#).unwrap())
        .unwrap();
    assert_eq!(memos.len(), 1);
    assert_eq!(memos[0].text("body"), Some("same body"));
    assert!(matches!(
        stack.fetch(&FetchRequest::new("Note")),
        Err(StackError::UnknownEntityType(_))
    ));
}

#[test]
fn mapping_model_is_discovered_next_to_bundle_model() {
    let dir = tempfile::tempdir().unwrap();
    let write_json = |name: &str, json: String| std::fs::write(dir.path().join(name), json).unwrap();
    let options = || {
        StackOptions::new(
            StoreKind::Sqlite,
            SchemaSource::Bundle {
                dir: dir.path().to_path_buf(),
                model_name: "Notes".to_string(),
            },
        )
        .with_store_url(dir.path().join("notes.sqlite3"))
    };

    write_json("Notes.json", serde_json::to_string(&notes_v1()).unwrap());
    {
        let stack = PersistenceStack::open(options()).unwrap();
        stack.create("Note", attributes! { "title" => "bundled" }).unwrap();
        stack.save().unwrap();
        stack.close().unwrap();
    }

    write_json("Notes.json", serde_json::to_string(&memos_v2()).unwrap());
    write_json(
        &MappingModel::file_name("Notes", 1, 2),
        serde_json::to_string(&memo_mapping()).unwrap(),
    );

    let stack = PersistenceStack::open(options()).unwrap();
    assert!(stack.requires_migration());
    stack.migrate().unwrap();
    let memos = stack.fetch(&FetchRequest::new("Memo")).unwrap();
    assert_eq!(memos[0].text("heading"), Some("bundled"));
}

fn required_body() -> SchemaDescriptor {
    SchemaDescriptor::new("Notes", 2).with_entity(
        EntityDescription::new("Note")
            .with_attribute(AttributeDescription::text("title").required())
            .with_attribute(AttributeDescription::text("body").required()),
    )
}

#[test]
fn failed_migration_keeps_previous_stamp() {
    let dir = tempfile::tempdir().unwrap();
    let url = dir.path().join("notes.sqlite3");
    seed_v1(&url, &[("with body", Some("text")), ("without body", None)]);

    {
        let stack = PersistenceStack::open(sqlite_options(&url, required_body())).unwrap();
        assert!(matches!(
            stack.migrate(),
            Err(StackError::Migration(MigrationError::MigrationFailed(_)))
        ));
        assert_eq!(stack.store().stamped_version(), 1);
        assert!(stack.requires_migration());
        stack.close().unwrap();
    }

    // The store is still a readable v1 store.
    let stack = PersistenceStack::open(sqlite_options(&url, notes_v1())).unwrap();
    assert!(!stack.requires_migration());
    assert_eq!(stack.count(&FetchRequest::new("Note")).unwrap(), 2);
}

#[test]
fn fill_value_satisfies_newly_required_attribute() {
    let dir = tempfile::tempdir().unwrap();
    let url = dir.path().join("notes.sqlite3");
    seed_v1(&url, &[("without body", None)]);

    let stack = PersistenceStack::open(
        sqlite_options(&url, required_body())
            .with_mapping_model(MappingModel::new(1, 2).fill("Note", "body", "(empty)")),
    )
    .unwrap();
    stack.migrate().unwrap();

    let notes = stack.fetch(&FetchRequest::new("Note")).unwrap();
    assert_eq!(notes[0].text("body"), Some("(empty)"));
}
