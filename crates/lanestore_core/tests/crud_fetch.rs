use lanestore_core::{
    attributes, AttributeDescription, AttributeValue, Attributes, ContextKind, Entity,
    EntityDescription, EntityInstance, FetchRequest, PersistenceStack, Predicate,
    SchemaDescriptor, SortDescriptor, StackError, StackOptions, StackResult,
};

fn notes_schema() -> SchemaDescriptor {
    SchemaDescriptor::new("Notes", 1).with_entity(
        EntityDescription::new("Note")
            .with_attribute(AttributeDescription::text("title").required().unique())
            .with_attribute(AttributeDescription::text("body"))
            .with_attribute(AttributeDescription::integer("priority").with_default(0))
            .with_attribute(AttributeDescription::boolean("pinned").with_default(false)),
    )
}

fn open_stack() -> PersistenceStack {
    PersistenceStack::open(StackOptions::in_memory(notes_schema())).unwrap()
}

fn titles(instances: &[EntityInstance]) -> Vec<&str> {
    instances
        .iter()
        .map(|instance| instance.text("title").unwrap_or("<nil>"))
        .collect()
}

#[test]
fn created_note_is_fetched_by_predicate_after_save() {
    let stack = open_stack();
    let created = stack
        .create("Note", attributes! { "title" => "A", "body" => "x" })
        .unwrap();
    assert!(stack.save().unwrap());

    let request = FetchRequest::new("Note").filter(r#"title == "A""#).unwrap();
    let fetched = stack.fetch(&request).unwrap();

    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].id(), created.id());
    assert_eq!(fetched[0].text("body"), Some("x"));
    assert_eq!(fetched[0].integer("priority"), Some(0));
    assert_eq!(fetched[0].boolean("pinned"), Some(false));
    assert_eq!(fetched[0].context(), stack.context(ContextKind::Read).id());
}

#[test]
fn save_without_changes_reports_false() {
    let stack = open_stack();
    assert!(!stack.save().unwrap());
    assert!(!stack.save_in(ContextKind::Read).unwrap());
}

#[test]
fn unknown_entity_is_rejected_everywhere() {
    let stack = open_stack();
    assert!(matches!(
        stack.create("Ghost", attributes! {}),
        Err(StackError::UnknownEntityType(name)) if name == "Ghost"
    ));
    assert!(matches!(
        stack.fetch(&FetchRequest::new("Ghost")),
        Err(StackError::UnknownEntityType(_))
    ));
    assert!(matches!(
        stack.delete_all("Ghost"),
        Err(StackError::UnknownEntityType(_))
    ));
}

#[test]
fn fetch_with_no_match_returns_empty() {
    let stack = open_stack();
    let request = FetchRequest::new("Note").with_predicate(Predicate::eq("title", "missing"));
    assert!(stack.fetch(&request).unwrap().is_empty());
}

#[test]
fn delete_all_then_fetch_is_empty() {
    let stack = open_stack();
    for title in ["a", "b", "c"] {
        stack.create("Note", attributes! { "title" => title }).unwrap();
    }
    stack.save().unwrap();

    stack.create("Note", attributes! { "title" => "pending" }).unwrap();
    stack.delete_all("Note").unwrap();
    assert!(stack.save().unwrap());

    assert!(stack.fetch(&FetchRequest::new("Note")).unwrap().is_empty());
    assert_eq!(stack.count(&FetchRequest::new("Note")).unwrap(), 0);
}

#[test]
fn failed_unique_commit_leaves_store_unchanged() {
    let stack = open_stack();
    stack.create("Note", attributes! { "title" => "same" }).unwrap();
    stack.create("Note", attributes! { "title" => "same" }).unwrap();

    let err = stack.save().unwrap_err();
    assert!(err.is_constraint_violation(), "unexpected error: {err}");
    assert!(stack.fetch(&FetchRequest::new("Note")).unwrap().is_empty());

    // Pending changes survive the failed commit until rolled back.
    assert!(stack.has_changes_in(ContextKind::Write).unwrap());
    stack.rollback_in(ContextKind::Write).unwrap();
    assert!(!stack.has_changes_in(ContextKind::Write).unwrap());
    assert!(!stack.save().unwrap());
}

#[test]
fn required_attribute_is_validated_before_sql() {
    let stack = open_stack();
    stack.create("Note", attributes! { "body" => "untitled" }).unwrap();

    assert!(matches!(
        stack.save(),
        Err(StackError::Validation { attribute, .. }) if attribute == "title"
    ));
}

#[test]
fn non_finite_real_never_reaches_a_required_column() {
    let schema = SchemaDescriptor::new("Scores", 1).with_entity(
        EntityDescription::new("Measurement")
            .with_attribute(AttributeDescription::text("title").required())
            .with_attribute(AttributeDescription::real("score").required()),
    );
    let stack = PersistenceStack::open(StackOptions::in_memory(schema)).unwrap();

    assert!(matches!(
        stack.create("Measurement", attributes! { "title" => "n", "score" => f64::NAN }),
        Err(StackError::Validation { attribute, .. }) if attribute == "score"
    ));
    let measured = stack
        .create("Measurement", attributes! { "title" => "m", "score" => 1.5 })
        .unwrap();
    assert!(matches!(
        stack.update(&measured, attributes! { "score" => f64::INFINITY }),
        Err(StackError::Validation { .. })
    ));
    assert!(stack.save().unwrap());

    let stored = stack.fetch(&FetchRequest::new("Measurement")).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].real("score"), Some(1.5));
}

#[test]
fn create_rejects_unknown_and_mistyped_attributes() {
    let stack = open_stack();
    assert!(matches!(
        stack.create("Note", attributes! { "title" => "a", "color" => "red" }),
        Err(StackError::UnknownAttribute { attribute, .. }) if attribute == "color"
    ));
    assert!(matches!(
        stack.create("Note", attributes! { "title" => "a", "priority" => "high" }),
        Err(StackError::TypeMismatch { attribute, .. }) if attribute == "priority"
    ));
}

#[test]
fn predicates_sort_and_page_in_sql() {
    let stack = open_stack();
    for (title, priority, pinned) in [
        ("alpha", 5, true),
        ("beta", 3, false),
        ("gamma", 4, true),
        ("delta", 1, false),
        ("epsilon", 2, true),
    ] {
        stack
            .create(
                "Note",
                attributes! { "title" => title, "priority" => priority, "pinned" => pinned },
            )
            .unwrap();
    }
    stack.save().unwrap();

    let by_priority = FetchRequest::new("Note").sorted_by(SortDescriptor::ascending("priority"));
    let page = stack.fetch(&by_priority.clone().offset(1).limit(2)).unwrap();
    assert_eq!(titles(&page), vec!["epsilon", "beta"]);

    let pinned = FetchRequest::new("Note")
        .filter("pinned == true AND priority >= 4")
        .unwrap()
        .sorted_by(SortDescriptor::descending("title"));
    assert_eq!(titles(&stack.fetch(&pinned).unwrap()), vec!["gamma", "alpha"]);

    let contains = FetchRequest::new("Note")
        .filter(r#"title CONTAINS "lt" OR title ENDSWITH "on""#)
        .unwrap();
    assert_eq!(titles(&stack.fetch(&contains).unwrap()), vec!["delta", "epsilon"]);

    assert_eq!(
        stack
            .count(&FetchRequest::new("Note").filter("NOT pinned == true").unwrap())
            .unwrap(),
        2
    );
    assert_eq!(stack.count(&by_priority.limit(3)).unwrap(), 3);
}

#[test]
fn invalid_predicates_are_rejected() {
    let stack = open_stack();
    assert!(matches!(
        FetchRequest::new("Note").filter("title =="),
        Err(StackError::InvalidPredicate(_))
    ));
    assert!(matches!(
        stack.fetch(&FetchRequest::new("Note").with_predicate(Predicate::gt("rank", 1))),
        Err(StackError::UnknownAttribute { .. })
    ));
    assert!(matches!(
        stack.fetch(&FetchRequest::new("Note").with_predicate(Predicate::eq("priority", "x"))),
        Err(StackError::TypeMismatch { .. })
    ));
}

#[test]
fn write_context_fetch_sees_its_pending_changes() {
    let stack = open_stack();
    let kept = stack
        .create("Note", attributes! { "title" => "kept", "priority" => 1 })
        .unwrap();
    let doomed = stack.create("Note", attributes! { "title" => "doomed" }).unwrap();
    stack.save().unwrap();

    stack
        .create("Note", attributes! { "title" => "fresh", "priority" => 9 })
        .unwrap();
    stack.update(&kept, attributes! { "priority" => 7 }).unwrap();
    stack.delete(&doomed).unwrap();

    let high = FetchRequest::new("Note")
        .filter("priority > 5")
        .unwrap()
        .sorted_by(SortDescriptor::ascending("priority"));
    assert_eq!(
        titles(&stack.fetch_in(ContextKind::Write, &high).unwrap()),
        vec!["kept", "fresh"]
    );
    assert_eq!(
        stack.count_in(ContextKind::Write, &FetchRequest::new("Note")).unwrap(),
        2
    );

    // The read context only sees committed state.
    assert!(stack.fetch(&high).unwrap().is_empty());
    assert_eq!(stack.count(&FetchRequest::new("Note")).unwrap(), 2);

    assert!(stack.save().unwrap());
    assert_eq!(titles(&stack.fetch(&high).unwrap()), vec!["kept", "fresh"]);
}

#[test]
fn pending_update_keeps_row_order_for_sort_ties() {
    let stack = open_stack();
    let first = stack
        .create("Note", attributes! { "title" => "first", "priority" => 1 })
        .unwrap();
    for title in ["second", "third"] {
        stack
            .create("Note", attributes! { "title" => title, "priority" => 2 })
            .unwrap();
    }
    stack.save().unwrap();

    stack.update(&first, attributes! { "priority" => 2 }).unwrap();
    let request = FetchRequest::new("Note")
        .filter("priority == 2")
        .unwrap()
        .sorted_by(SortDescriptor::ascending("priority"));

    let pending = stack.fetch_in(ContextKind::Write, &request).unwrap();
    assert_eq!(titles(&pending), vec!["first", "second", "third"]);

    stack.save().unwrap();
    let committed = stack.fetch_in(ContextKind::Write, &request).unwrap();
    assert_eq!(titles(&committed), titles(&pending));
}

#[test]
fn update_and_delete_round_trip_through_store() {
    let stack = open_stack();
    let note = stack
        .create("Note", attributes! { "title" => "draft", "body" => "v1" })
        .unwrap();
    stack.save().unwrap();

    let updated = stack
        .update(&note, attributes! { "body" => "v2", "pinned" => true })
        .unwrap();
    assert_eq!(updated.text("title"), Some("draft"));
    stack.save().unwrap();

    let loaded = stack.object_with_id("Note", note.id()).unwrap();
    assert_eq!(loaded.text("body"), Some("v2"));
    assert_eq!(loaded.boolean("pinned"), Some(true));

    stack.delete(&note).unwrap();
    stack.save().unwrap();
    assert!(matches!(
        stack.object_with_id("Note", note.id()),
        Err(StackError::ObjectNotFound(id)) if id == note.id()
    ));
}

#[test]
fn update_of_removed_object_reports_not_found() {
    let stack = open_stack();
    let note = stack.create("Note", attributes! { "title" => "gone" }).unwrap();
    stack.save().unwrap();

    stack.delete(&note).unwrap();
    assert!(matches!(
        stack.update(&note, attributes! { "body" => "late" }),
        Err(StackError::ObjectNotFound(_))
    ));
}

#[test]
fn nil_values_follow_comparison_rules() {
    let stack = open_stack();
    stack
        .create("Note", attributes! { "title" => "empty", "body" => AttributeValue::Null })
        .unwrap();
    stack
        .create("Note", attributes! { "title" => "full", "body" => "text" })
        .unwrap();
    stack.save().unwrap();

    let no_body = FetchRequest::new("Note").filter("body == nil").unwrap();
    assert_eq!(titles(&stack.fetch(&no_body).unwrap()), vec!["empty"]);

    let not_text = FetchRequest::new("Note").filter(r#"body != "text""#).unwrap();
    assert!(stack.fetch(&not_text).unwrap().is_empty());

    let sorted = FetchRequest::new("Note").sorted_by(SortDescriptor::ascending("body"));
    assert_eq!(titles(&stack.fetch(&sorted).unwrap()), vec!["empty", "full"]);
}

#[derive(Debug, PartialEq)]
struct Note {
    title: String,
    priority: i64,
}

impl Entity for Note {
    const ENTITY_NAME: &'static str = "Note";

    fn attribute_names() -> &'static [&'static str] {
        &["title", "priority"]
    }

    fn to_attributes(&self) -> Attributes {
        attributes! { "title" => self.title.as_str(), "priority" => self.priority }
    }

    fn from_instance(instance: &EntityInstance) -> StackResult<Self> {
        Ok(Self {
            title: instance.text("title").unwrap_or_default().to_string(),
            priority: instance.integer("priority").unwrap_or_default(),
        })
    }
}

struct Stray;

impl Entity for Stray {
    const ENTITY_NAME: &'static str = "Note";

    fn attribute_names() -> &'static [&'static str] {
        &["title", "color"]
    }

    fn to_attributes(&self) -> Attributes {
        Attributes::new()
    }

    fn from_instance(_instance: &EntityInstance) -> StackResult<Self> {
        Ok(Self)
    }
}

#[test]
fn typed_entities_round_trip() {
    let stack = open_stack();
    stack.register::<Note>().unwrap();
    stack
        .create_object(Note {
            title: "typed".to_string(),
            priority: 4,
        })
        .unwrap();
    stack.save().unwrap();

    let notes: Vec<Note> = stack.fetch_objects(&FetchRequest::new("Note")).unwrap();
    assert_eq!(
        notes,
        vec![Note {
            title: "typed".to_string(),
            priority: 4
        }]
    );

    assert!(matches!(
        stack.register::<Stray>(),
        Err(StackError::UnknownAttribute { attribute, .. }) if attribute == "color"
    ));
}
