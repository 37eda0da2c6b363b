mod common;

use aideon_taxis_core::{Audit, ErrorCode, Id, Payload, ReferenceKey, TaxisResult};
use common::{RecordingExecutor, Store, payload};
use serde_json::json;

fn id_of(created: &Payload) -> Id {
    let raw = created["__identifier"].as_str().expect("identifier");
    Id::parse(raw).expect("uuid")
}

struct Catalogue {
    customer: Id,
    product: Id,
    tags: Vec<Id>,
}

fn seed(store: &Store, executor: &RecordingExecutor<'_>) -> TaxisResult<Catalogue> {
    let dao = store.dao(executor);
    let customer = dao.create("Customer", &payload(json!({"name": "Ada", "credit_limit": 250.0})))?;
    let product = dao.create("Product", &payload(json!({"name": "Widget", "sku": "W-1"})))?;
    let mut tags = Vec::new();
    for label in ["rush", "gift", "fragile", "bulk"] {
        tags.push(id_of(&dao.create("Tag", &payload(json!({"label": label})))?));
    }
    executor.take();
    Ok(Catalogue {
        customer: id_of(&customer),
        product: id_of(&product),
        tags,
    })
}

fn order_payload(catalogue: &Catalogue) -> Payload {
    payload(json!({
        "order_number": "A-1",
        "customer": {"__identifier": catalogue.customer.to_string()},
        "items": [
            {"quantity": 2, "price": 4.5, "product": {"__identifier": catalogue.product.to_string()}},
            {"quantity": 1, "product": {"__identifier": catalogue.product.to_string()}}
        ],
        "tags": [{"__identifier": catalogue.tags[0].to_string()}],
        "shipment": {"carrier": "DHL"}
    }))
}

fn position(log: &[String], prefix: &str) -> usize {
    log.iter()
        .position(|sql| sql.starts_with(prefix))
        .unwrap_or_else(|| panic!("no statement starting with {prefix}"))
}

#[test]
fn subtype_rows_are_written_root_table_first() -> TaxisResult<()> {
    let store = Store::new();
    let executor = RecordingExecutor::new(&store.conn);
    let created = store
        .dao(&executor)
        .with_audit(Audit::now(Some("u-7".into()), Some("Grace".into())))
        .create("Customer", &payload(json!({"name": "Ada", "credit_limit": 10.0})))?;
    let id = id_of(&created);

    let log = executor.take();
    assert!(position(&log, r#"INSERT INTO "party""#) < position(&log, r#"INSERT INTO "customer""#));
    assert_eq!(
        store.text(&format!(
            "SELECT __entity_type FROM customer WHERE __identifier = '{id}'"
        )),
        Some("Customer".into())
    );
    assert_eq!(
        store.text(&format!("SELECT name FROM party WHERE __identifier = '{id}'")),
        Some("Ada".into())
    );
    assert_eq!(
        store.text(&format!(
            "SELECT __created_by_id FROM party WHERE __identifier = '{id}'"
        )),
        Some("u-7".into())
    );
    assert_eq!(created["__version"], json!(1));
    Ok(())
}

#[test]
fn create_writes_the_tree_in_dependency_order() -> TaxisResult<()> {
    let store = Store::new();
    let executor = RecordingExecutor::new(&store.conn);
    let catalogue = seed(&store, &executor)?;

    let created = store.dao(&executor).create("Order", &order_payload(&catalogue))?;
    let order = id_of(&created);

    let log = executor.take();
    let shipment = position(&log, r#"INSERT INTO "shipment""#);
    let root = position(&log, r#"INSERT INTO "sales_order""#);
    let item = position(&log, r#"INSERT INTO "order_item""#);
    let tag = position(&log, r#"INSERT INTO "order_tag""#);
    assert!(shipment < root && root < item && item < tag);

    assert_eq!(
        store.text(&format!(
            "SELECT customer_id FROM sales_order WHERE __identifier = '{order}'"
        )),
        Some(catalogue.customer.to_string())
    );
    assert_eq!(
        store.count(&format!(
            "SELECT COUNT(*) FROM order_item WHERE order_id = '{order}' AND product_id = '{}'",
            catalogue.product
        )),
        2
    );
    assert_eq!(store.count("SELECT COUNT(*) FROM order_tag"), 1);
    assert_eq!(
        store.count("SELECT COUNT(*) FROM sales_order WHERE shipment_id IS NOT NULL"),
        1
    );
    Ok(())
}

#[test]
fn unknown_reference_targets_are_reported_before_writing() {
    let store = Store::new();
    let executor = RecordingExecutor::new(&store.conn);
    let catalogue = Catalogue {
        customer: Id::new(),
        product: Id::new(),
        tags: vec![Id::new()],
    };

    let err = store
        .dao(&executor)
        .create("Order", &order_payload(&catalogue))
        .expect_err("missing targets");
    assert_eq!(err.code(), Some(ErrorCode::EntityNotFound));
    assert_eq!(err.feedback().len(), 3);
    assert!(executor.take().iter().all(|sql| sql.starts_with("SELECT")));
}

#[test]
fn update_touches_changed_rows_and_bumps_versions() -> TaxisResult<()> {
    let store = Store::new();
    let executor = RecordingExecutor::new(&store.conn);
    let catalogue = seed(&store, &executor)?;
    let dao = store.dao(&executor);
    let original = dao.create("Order", &order_payload(&catalogue))?;
    let order = id_of(&original);

    let mut updated = original.clone();
    updated.insert("note".into(), json!("leave at door"));
    updated["items"][0]["quantity"] = json!(5);
    let report = dao.update("Order", &original, &updated)?;
    assert_eq!(report.updated, 2);
    assert_eq!(report.inserted, 0);

    assert_eq!(
        store.count(&format!(
            "SELECT __version FROM sales_order WHERE __identifier = '{order}'"
        )),
        2
    );
    assert_eq!(
        store.text(&format!("SELECT note FROM sales_order WHERE __identifier = '{order}'")),
        Some("leave at door".into())
    );
    assert_eq!(store.count("SELECT SUM(quantity) FROM order_item"), 6);

    let mut stale = original.clone();
    stale.insert("note".into(), json!("ring twice"));
    let err = dao
        .update("Order", &original, &stale)
        .expect_err("stale original");
    assert_eq!(err.code(), Some(ErrorCode::OutdatedInstance));
    Ok(())
}

#[test]
fn update_replaces_contained_children() -> TaxisResult<()> {
    let store = Store::new();
    let executor = RecordingExecutor::new(&store.conn);
    let catalogue = seed(&store, &executor)?;
    let dao = store.dao(&executor);
    let original = dao.create("Order", &order_payload(&catalogue))?;

    let mut updated = original.clone();
    updated.insert(
        "items".into(),
        json!([
            original["items"][1].clone(),
            {"quantity": 9, "product": {"__identifier": catalogue.product.to_string()}}
        ]),
    );
    updated.insert("shipment".into(), json!(null));
    let report = dao.update("Order", &original, &updated)?;
    assert_eq!(report.inserted, 1);
    assert_eq!(report.deleted, 2);

    assert_eq!(store.count("SELECT COUNT(*) FROM order_item"), 2);
    assert_eq!(store.count("SELECT SUM(quantity) FROM order_item"), 10);
    assert_eq!(store.count("SELECT COUNT(*) FROM shipment"), 0);
    assert_eq!(
        store.count("SELECT COUNT(*) FROM sales_order WHERE shipment_id IS NULL"),
        1
    );
    Ok(())
}

#[test]
fn delete_removes_the_containment_subtree_and_its_links() -> TaxisResult<()> {
    let store = Store::new();
    let executor = RecordingExecutor::new(&store.conn);
    let catalogue = seed(&store, &executor)?;
    let dao = store.dao(&executor);
    let order = id_of(&dao.create("Order", &order_payload(&catalogue))?);

    let report = dao.delete("Order", order)?;
    assert_eq!(report.deleted, 4);
    for table in ["sales_order", "order_item", "shipment", "order_tag"] {
        assert_eq!(store.count(&format!("SELECT COUNT(*) FROM {table}")), 0, "{table}");
    }
    assert_eq!(store.count("SELECT COUNT(*) FROM product"), 1);
    assert_eq!(store.count("SELECT COUNT(*) FROM tag"), 4);
    assert_eq!(store.count("SELECT COUNT(*) FROM customer"), 1);

    let err = dao.delete("Order", order).expect_err("already gone");
    assert_eq!(err.code(), Some(ErrorCode::EntityNotFound));
    Ok(())
}

#[test]
fn references_are_added_removed_and_repointed() -> TaxisResult<()> {
    let store = Store::new();
    let executor = RecordingExecutor::new(&store.conn);
    let catalogue = seed(&store, &executor)?;
    let dao = store.dao(&executor);
    let order = id_of(&dao.create("Order", &order_payload(&catalogue))?);

    let report = dao.add_references("Order", order, "tags", &catalogue.tags[1..3])?;
    assert_eq!(report.references_added, 2);
    assert_eq!(store.count("SELECT COUNT(*) FROM order_tag"), 3);

    let report = dao.remove_references("Order", order, "tags", &catalogue.tags[..1])?;
    assert_eq!(report.references_removed, 1);
    assert_eq!(store.count("SELECT COUNT(*) FROM order_tag"), 2);

    let other = id_of(&dao.create("Customer", &payload(json!({"name": "Lin"})))?);
    dao.set_reference("Order", order, "customer", Some(other))?;
    assert_eq!(
        store.text(&format!(
            "SELECT customer_id FROM sales_order WHERE __identifier = '{order}'"
        )),
        Some(other.to_string())
    );

    let graph = dao.load_graph("Order", order)?;
    assert_eq!(graph.referenced_ids(&ReferenceKey::new("Order", "customer")), vec![other]);
    assert_eq!(graph.referenced_ids(&ReferenceKey::new("Order", "tags")).len(), 2);
    assert_eq!(graph.contained_ids(&ReferenceKey::new("Order", "items")).len(), 2);
    assert_eq!(graph.contained_ids(&ReferenceKey::new("Order", "shipment")).len(), 1);

    let customer = dao.load_graph("Party", other)?;
    assert_eq!(customer.entity_type, "Customer");
    assert_eq!(
        customer.referenced_ids(&ReferenceKey::new("Customer", "orders")),
        vec![order]
    );
    Ok(())
}

#[test]
fn notes_are_linked_through_the_inherited_join_table() -> TaxisResult<()> {
    let store = Store::new();
    let executor = RecordingExecutor::new(&store.conn);
    let dao = store.dao(&executor);
    let supplier = dao.create(
        "Supplier",
        &payload(json!({
            "name": "Acme",
            "rating": 4,
            "notes": [{"text": "net 30"}, {"text": "ships fridays"}]
        })),
    )?;
    let supplier = id_of(&supplier);
    assert_eq!(
        store.count(&format!(
            "SELECT COUNT(*) FROM party_note WHERE party_id = '{supplier}'"
        )),
        2
    );

    dao.delete("Supplier", supplier)?;
    assert_eq!(store.count("SELECT COUNT(*) FROM note"), 0);
    assert_eq!(store.count("SELECT COUNT(*) FROM party"), 0);
    Ok(())
}
