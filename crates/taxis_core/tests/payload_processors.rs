mod common;

use aideon_taxis_core::{
    DeletePayloadProcessor, ErrorCode, Id, IdentifierProvider, InsertPayloadProcessor,
    InstanceGraph, ReferenceChange, ReferenceKey, ReferencePayloadProcessor, Statement,
    StatementSet, TaxisResult, UpdatePayloadProcessor, Value,
};
use common::{Fixture, StaticCollector, payload};
use serde_json::json;

struct Persisted {
    order: Id,
    customer: Id,
    item: Id,
    product: Id,
    tags: [Id; 2],
}

impl Persisted {
    fn new() -> Self {
        Self {
            order: Id::new(),
            customer: Id::new(),
            item: Id::new(),
            product: Id::new(),
            tags: [Id::new(), Id::new()],
        }
    }

    fn payload(&self) -> serde_json::Value {
        json!({
            "__identifier": self.order.to_string(),
            "__entityType": "Order",
            "__version": 3,
            "order_number": "A-1",
            "note": "leave at door",
            "customer": {"__identifier": self.customer.to_string()},
            "items": [{
                "__identifier": self.item.to_string(),
                "__version": 1,
                "quantity": 2,
                "product": {"__identifier": self.product.to_string()}
            }],
            "tags": [
                {"__identifier": self.tags[0].to_string()},
                {"__identifier": self.tags[1].to_string()}
            ]
        })
    }

    fn graph(&self) -> InstanceGraph {
        InstanceGraph::new("Order", self.order)
            .with_reference(ReferenceKey::new("Order", "customer"), "Customer", self.customer)
            .with_reference(ReferenceKey::new("Order", "tags"), "Tag", self.tags[0])
            .with_reference(ReferenceKey::new("Order", "tags"), "Tag", self.tags[1])
            .with_child(
                ReferenceKey::new("Order", "items"),
                InstanceGraph::new("OrderItem", self.item).with_reference(
                    ReferenceKey::new("OrderItem", "product"),
                    "Product",
                    self.product,
                ),
            )
    }

    fn collector(&self) -> StaticCollector {
        StaticCollector::default().with(self.graph())
    }
}

#[test]
fn create_order_with_items_emits_inserts_and_product_links() -> TaxisResult<()> {
    let fixture = Fixture::new();
    let (customer, product) = (Id::new(), Id::new());
    let source = payload(json!({
        "order_number": "A-1",
        "customer": {"__identifier": customer.to_string()},
        "items": [
            {"quantity": 1, "product": {"__identifier": product.to_string()}},
            {"quantity": "3", "price": 9.5, "product": {"__identifier": product.to_string()}}
        ]
    }));

    let (created, statements) = InsertPayloadProcessor::new(fixture.ctx()).insert("Order", &source)?;
    let set = StatementSet::from(statements);
    assert_eq!(set.inserts.len(), 3);
    let product_links: Vec<_> = set
        .add_references
        .iter()
        .filter(|add| add.reference == ReferenceKey::new("OrderItem", "product"))
        .collect();
    assert_eq!(product_links.len(), 2);
    assert_eq!(set.add_references.len(), 3);
    assert_eq!(set.exists_checks.len(), 3);

    let root = &set.inserts[0];
    assert!(root.container.is_none());
    assert_eq!(root.instance.version, Some(1));
    for child in &set.inserts[1..] {
        let link = child.container.as_ref().expect("container link");
        assert_eq!(link.owner, root.instance.id);
        assert_eq!(link.reference, ReferenceKey::new("Order", "items"));
    }
    assert_eq!(
        set.inserts[2].instance.attributes.get("quantity"),
        Some(&Value::I64(3))
    );

    assert_eq!(
        fixture.identifiers.read(&created)?,
        Some(root.instance.id)
    );
    assert_eq!(created["__entityType"], json!("Order"));
    assert_eq!(created["__version"], json!(1));
    assert!(created["items"][1]["__identifier"].is_string());
    Ok(())
}

#[test]
fn create_collects_every_validation_problem() {
    let fixture = Fixture::new();
    let source = payload(json!({
        "__identifier": Id::new().to_string(),
        "customer": {"name": "inline customers are not allowed"},
        "items": [{"product": {"__identifier": Id::new().to_string()}}],
        "tags": [
            {"__identifier": Id::new().to_string()},
            {"__identifier": Id::new().to_string()},
            {"__identifier": Id::new().to_string()},
            {"__identifier": Id::new().to_string()}
        ]
    }));

    let err = InsertPayloadProcessor::new(fixture.ctx())
        .insert("Order", &source)
        .expect_err("invalid payload");
    let codes: Vec<(ErrorCode, &str)> = err
        .feedback()
        .iter()
        .map(|entry| (entry.code, entry.location.as_str()))
        .collect();
    assert!(codes.contains(&(ErrorCode::IdentifierNotAllowed, "")));
    assert!(codes.contains(&(ErrorCode::MissingRequiredAttribute, "order_number")));
    assert!(codes.contains(&(ErrorCode::UnexpectedPayloadContent, "customer")));
    assert!(codes.contains(&(ErrorCode::IdentifierMandatory, "customer")));
    assert!(codes.contains(&(ErrorCode::MissingRequiredAttribute, "items[0].quantity")));
    assert!(codes.contains(&(ErrorCode::CardinalityViolation, "tags")));
}

#[test]
fn create_rejects_abstract_types_and_honours_subtype_tags() -> TaxisResult<()> {
    let fixture = Fixture::new();
    let processor = InsertPayloadProcessor::new(fixture.fail_fast());
    let err = processor
        .insert("Party", &payload(json!({"name": "Acme"})))
        .expect_err("abstract");
    assert_eq!(err.code(), Some(ErrorCode::InvalidPayloadValue));

    let (created, statements) = processor.insert(
        "Party",
        &payload(json!({"__entityType": "Customer", "name": "Acme", "credit_limit": 100})),
    )?;
    assert_eq!(created["__entityType"], json!("Customer"));
    match &statements[0] {
        Statement::Insert(insert) => {
            assert_eq!(insert.instance.entity_type, "Customer");
            assert_eq!(
                insert.instance.attributes.get("credit_limit"),
                Some(&Value::F64(100.0))
            );
        }
        other => panic!("unexpected {other:?}"),
    }
    Ok(())
}

#[test]
fn identical_payloads_produce_no_statements() -> TaxisResult<()> {
    let fixture = Fixture::new();
    let persisted = Persisted::new();
    let collector = persisted.collector();
    let original = payload(persisted.payload());
    let statements =
        UpdatePayloadProcessor::new(fixture.ctx(), &collector).diff("Order", &original, &original, true)?;
    assert!(statements.is_empty(), "{statements:?}");
    Ok(())
}

#[test]
fn echoed_association_content_is_ignored_for_kept_targets() -> TaxisResult<()> {
    let fixture = Fixture::new();
    let persisted = Persisted::new();
    let collector = persisted.collector();
    let mut original = payload(persisted.payload());
    original.insert(
        "customer".into(),
        json!({"__identifier": persisted.customer.to_string(), "name": "Ann"}),
    );
    original["tags"][0]["label"] = json!("rush");
    original["items"][0]["product"]["name"] = json!("Widget");

    let statements = UpdatePayloadProcessor::new(fixture.fail_fast(), &collector)
        .diff("Order", &original, &original, true)?;
    assert!(statements.is_empty(), "{statements:?}");

    let other = Id::new();
    let mut updated = original.clone();
    updated.insert(
        "customer".into(),
        json!({"__identifier": other.to_string(), "name": "Lin"}),
    );
    let err = UpdatePayloadProcessor::new(fixture.fail_fast(), &collector)
        .diff("Order", &original, &updated, true)
        .expect_err("new targets carry identity only");
    assert_eq!(err.code(), Some(ErrorCode::UnexpectedPayloadContent));
    assert_eq!(err.feedback()[0].location, "customer");
    Ok(())
}

#[test]
fn untagged_root_diffs_as_its_persisted_subtype() -> TaxisResult<()> {
    let fixture = Fixture::new();
    let customer = Id::new();
    let collector = StaticCollector::default().with(InstanceGraph::new("Customer", customer));
    let original = payload(json!({
        "__identifier": customer.to_string(),
        "__version": 1,
        "name": "Ada",
        "credit_limit": 10.0
    }));
    let mut updated = original.clone();
    updated.insert("credit_limit".into(), json!(25.0));

    let set = StatementSet::from(
        UpdatePayloadProcessor::new(fixture.ctx(), &collector)
            .diff("Party", &original, &updated, true)?,
    );
    assert_eq!(set.updates.len(), 1);
    assert_eq!(set.updates[0].instance.entity_type, "Customer");
    assert_eq!(
        set.updates[0].instance.attributes.get("credit_limit"),
        Some(&Value::F64(25.0))
    );
    Ok(())
}

#[test]
fn stale_version_is_outdated() {
    let fixture = Fixture::new();
    let persisted = Persisted::new();
    let collector = persisted.collector();
    let original = payload(persisted.payload());
    let mut updated = original.clone();
    updated.insert("__version".into(), json!(2));
    updated.insert("note".into(), json!("ring twice"));

    let err = UpdatePayloadProcessor::new(fixture.fail_fast(), &collector)
        .diff("Order", &original, &updated, true)
        .expect_err("outdated");
    assert_eq!(err.code(), Some(ErrorCode::OutdatedInstance));
    assert_eq!(err.feedback()[0].identifier, Some(persisted.order));
}

#[test]
fn changed_attributes_update_with_next_version() -> TaxisResult<()> {
    let fixture = Fixture::new();
    let persisted = Persisted::new();
    let collector = persisted.collector();
    let original = payload(persisted.payload());
    let mut updated = original.clone();
    updated.insert("note".into(), json!(null));
    updated["items"][0]["quantity"] = json!(5);
    updated.insert("placed_at".into(), json!(1_700_000_000));

    let set = StatementSet::from(
        UpdatePayloadProcessor::new(fixture.ctx(), &collector)
            .diff("Order", &original, &updated, true)?,
    );
    assert_eq!(set.updates.len(), 2);
    let order = &set.updates[0];
    assert_eq!(order.instance.id, persisted.order);
    assert_eq!(order.previous_version, Some(3));
    assert_eq!(order.instance.version, Some(4));
    assert_eq!(order.instance.attributes.len(), 1, "immutable placed_at is ignored");
    assert_eq!(order.instance.attributes.get("note"), Some(&Value::Null));

    let item = &set.updates[1];
    assert_eq!(item.instance.id, persisted.item);
    assert_eq!(item.instance.attributes.get("quantity"), Some(&Value::I64(5)));
    assert_eq!(item.instance.version, Some(2));
    assert_eq!(set.exists_checks.len(), 2);
    assert!(set.add_references.is_empty() && set.remove_references.is_empty());
    Ok(())
}

#[test]
fn multi_valued_association_diff_is_per_element() -> TaxisResult<()> {
    let fixture = Fixture::new();
    let persisted = Persisted::new();
    let collector = persisted.collector();
    let original = payload(persisted.payload());
    let added = Id::new();
    let mut updated = original.clone();
    updated.insert(
        "tags".into(),
        json!([
            {"__identifier": persisted.tags[1].to_string()},
            {"__identifier": added.to_string()}
        ]),
    );

    let set = StatementSet::from(
        UpdatePayloadProcessor::new(fixture.ctx(), &collector)
            .diff("Order", &original, &updated, true)?,
    );
    assert_eq!(set.remove_references.len(), 1);
    assert!(set.remove_references[0].referenced_ids.contains(&persisted.tags[0]));
    assert!(set.remove_references[0].already_referencing_instances);
    assert_eq!(set.add_references.len(), 1);
    assert!(set.add_references[0].referenced_ids.contains(&added));
    assert_eq!(set.exists_checks.len(), 1);
    assert_eq!(set.exists_checks[0].id, added);
    assert_eq!(set.exists_checks[0].entity_type, "Tag");
    Ok(())
}

#[test]
fn single_valued_association_repoints() -> TaxisResult<()> {
    let fixture = Fixture::new();
    let persisted = Persisted::new();
    let collector = persisted.collector();
    let original = payload(persisted.payload());
    let other = Id::new();
    let mut updated = original.clone();
    updated.insert("customer".into(), json!({"__identifier": other.to_string()}));

    let set = StatementSet::from(
        UpdatePayloadProcessor::new(fixture.ctx(), &collector)
            .diff("Order", &original, &updated, true)?,
    );
    assert_eq!(set.remove_references.len(), 1);
    assert!(set.remove_references[0].referenced_ids.contains(&persisted.customer));
    assert_eq!(set.add_references.len(), 1);
    assert_eq!(set.add_references[0].change, ReferenceChange::Repoint);
    assert!(set.add_references[0].referenced_ids.contains(&other));
    Ok(())
}

#[test]
fn references_missing_from_original_resolve_through_graph() -> TaxisResult<()> {
    let fixture = Fixture::new();
    let persisted = Persisted::new();
    let collector = persisted.collector();
    let mut original = payload(persisted.payload());
    original.remove("tags");
    let mut updated = original.clone();
    updated.insert("tags".into(), json!([]));

    let set = StatementSet::from(
        UpdatePayloadProcessor::new(fixture.ctx(), &collector)
            .diff("Order", &original, &updated, true)?,
    );
    assert_eq!(set.remove_references.len(), 2);
    assert!(set.add_references.is_empty());
    Ok(())
}

#[test]
fn containment_diff_inserts_and_deletes_children() -> TaxisResult<()> {
    let fixture = Fixture::new();
    let persisted = Persisted::new();
    let collector = persisted.collector();
    let original = payload(persisted.payload());
    let product = Id::new();
    let mut updated = original.clone();
    updated.insert(
        "items".into(),
        json!([{"quantity": 7, "product": {"__identifier": product.to_string()}}]),
    );

    let statements = UpdatePayloadProcessor::new(fixture.ctx(), &collector)
        .diff("Order", &original, &updated, true)?;
    let set = StatementSet::from(statements);
    assert_eq!(set.inserts.len(), 1);
    let link = set.inserts[0].container.as_ref().expect("link");
    assert_eq!(link.owner, persisted.order);
    assert_eq!(set.deletes.len(), 1);
    assert_eq!(set.deletes[0].id, persisted.item);

    let detached: Vec<_> = set
        .remove_references
        .iter()
        .map(|remove| (remove.id, remove.reference.to_string()))
        .collect();
    assert!(detached.contains(&(persisted.order, "Order.items".to_string())));
    assert!(detached.contains(&(persisted.item, "OrderItem.product".to_string())));
    Ok(())
}

#[test]
fn containment_identity_errors() {
    let fixture = Fixture::new();
    let persisted = Persisted::new();
    let collector = persisted.collector();
    let original = payload(persisted.payload());
    let stranger = Id::new().to_string();
    let mut updated = original.clone();
    updated.insert(
        "items".into(),
        json!([
            {"__identifier": stranger, "quantity": 1},
            {"__identifier": persisted.item.to_string(), "quantity": 1},
            {"__identifier": persisted.item.to_string(), "quantity": 1}
        ]),
    );
    updated.insert("shipment".into(), json!({"__identifier": Id::new().to_string()}));

    let err = UpdatePayloadProcessor::new(fixture.ctx(), &collector)
        .diff("Order", &original, &updated, true)
        .expect_err("identity errors");
    let codes: Vec<ErrorCode> = err.feedback().iter().map(|entry| entry.code).collect();
    assert!(codes.contains(&ErrorCode::IdentifierNotAllowed));
    assert!(codes.contains(&ErrorCode::DuplicateIdentifier));
}

#[test]
fn root_identity_is_required_and_must_match() {
    let fixture = Fixture::new();
    let persisted = Persisted::new();
    let collector = persisted.collector();
    let processor = UpdatePayloadProcessor::new(fixture.ctx(), &collector);
    let original = payload(persisted.payload());

    let mut anonymous = original.clone();
    anonymous.remove("__identifier");
    let err = processor
        .diff("Order", &original, &anonymous, true)
        .expect_err("no id");
    assert_eq!(err.code(), Some(ErrorCode::IdentifierMandatory));

    let mut other = original.clone();
    other.insert("__identifier".into(), json!(Id::new().to_string()));
    let err = processor
        .diff("Order", &original, &other, true)
        .expect_err("mismatch");
    assert_eq!(err.code(), Some(ErrorCode::IdentifierMismatch));
}

#[test]
fn delete_processor_walks_the_persisted_subtree() -> TaxisResult<()> {
    let fixture = Fixture::new();
    let persisted = Persisted::new();
    let collector = persisted.collector();
    let statements =
        DeletePayloadProcessor::new(fixture.ctx(), &collector).delete("Order", persisted.order)?;
    let set = StatementSet::from(statements);
    let deleted: Vec<Id> = set.deletes.iter().map(|delete| delete.id).collect();
    assert_eq!(deleted, vec![persisted.item, persisted.order]);
    assert_eq!(set.remove_references.len(), 3);
    Ok(())
}

#[test]
fn reference_processor_maintains_associations() -> TaxisResult<()> {
    let fixture = Fixture::new();
    let persisted = Persisted::new();
    let collector = persisted.collector();
    let processor = ReferencePayloadProcessor::new(fixture.fail_fast(), &collector);

    let other = Id::new();
    let statements = processor.set_reference("Order", persisted.order, "customer", Some(other))?;
    let set = StatementSet::from(statements);
    assert_eq!(set.remove_references.len(), 1);
    assert_eq!(set.add_references[0].change, ReferenceChange::Repoint);

    let unchanged =
        processor.set_reference("Order", persisted.order, "customer", Some(persisted.customer))?;
    assert!(unchanged.is_empty());

    let fresh = Id::new();
    let statements =
        processor.add_references("Order", persisted.order, "tags", &[persisted.tags[0], fresh])?;
    let set = StatementSet::from(statements);
    assert_eq!(set.add_references.len(), 1);
    assert_eq!(set.add_references[0].referenced_ids.len(), 1);
    assert!(set.add_references[0].already_referencing_instances);

    let err = processor
        .remove_references("Order", persisted.order, "tags", &[fresh])
        .expect_err("not referenced");
    assert_eq!(err.code(), Some(ErrorCode::EntityNotFound));

    let err = processor
        .add_references("Order", persisted.order, "items", &[fresh])
        .expect_err("containment");
    assert_eq!(err.code(), Some(ErrorCode::UnexpectedPayloadContent));
    Ok(())
}
