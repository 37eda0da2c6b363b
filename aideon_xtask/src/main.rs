use std::fs;
use std::path::{Path, PathBuf};

use aideon_taxis_core::{
    DefaultCoercer, Id, InsertPayloadProcessor, MetadataResolver, Model, Payload,
    ProcessorContext, Statement, StatementSet, StorageRule, UuidIdentifierProvider,
};
use aideon_taxis_store::{
    ColumnNames, Dialect, DependencyResolver, LogicalQuery, PayloadDao, QueryBuilder,
    SqlStatement, SqliteExecutor, load_model, load_or_init_config, open_sqlite,
};
use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = match cli.command {
        Command::CheckModel(args) => serde_json::to_value(check_model(&args.model)?)?,
        Command::PlanCreate(args) => serde_json::to_value(plan_create(&args)?)?,
        Command::RenderQuery(args) => serde_json::to_value(render_query(&args)?)?,
        Command::Create(args) => create(&args)?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Developer utilities for Taxis models and stores"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a model file and summarize its types and references.
    CheckModel(CheckModelArgs),
    /// Show the statements and insert order a create payload produces.
    PlanCreate(PlanCreateArgs),
    /// Render a logical query JSON file as SQL.
    RenderQuery(RenderQueryArgs),
    /// Create a payload in the datastore configured under a directory.
    Create(CreateArgs),
}

#[derive(Parser)]
struct CheckModelArgs {
    /// Path to the model JSON document.
    #[arg(long)]
    model: PathBuf,
}

#[derive(Parser)]
struct PlanCreateArgs {
    #[arg(long)]
    model: PathBuf,
    /// Concrete or abstract entity type of the payload root.
    #[arg(long)]
    entity_type: String,
    /// Path to the JSON payload.
    #[arg(long)]
    payload: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum DialectArg {
    Sqlite,
    Postgres,
    Mysql,
}

impl From<DialectArg> for Dialect {
    fn from(value: DialectArg) -> Self {
        match value {
            DialectArg::Sqlite => Dialect::Sqlite,
            DialectArg::Postgres => Dialect::Postgres,
            DialectArg::Mysql => Dialect::Mysql,
        }
    }
}

#[derive(Parser)]
struct RenderQueryArgs {
    #[arg(long)]
    model: PathBuf,
    /// Path to the logical query JSON.
    #[arg(long)]
    query: PathBuf,
    /// JSON object of context parameters.
    #[arg(long)]
    params: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = DialectArg::Sqlite)]
    dialect: DialectArg,
}

#[derive(Parser)]
struct CreateArgs {
    /// Directory holding taxis.json, created with defaults when missing.
    #[arg(long, default_value = ".taxis")]
    datastore: PathBuf,
    #[arg(long)]
    entity_type: String,
    #[arg(long)]
    payload: PathBuf,
}

#[derive(Debug, Serialize)]
struct ModelSummary {
    version: Option<String>,
    types: Vec<TypeSummary>,
}

#[derive(Debug, Serialize)]
struct TypeSummary {
    name: String,
    table: String,
    chain: Vec<String>,
    attributes: usize,
    references: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CreatePlan {
    created: Payload,
    inserts: Vec<PlannedInsert>,
    exists_checks: usize,
    deferred_links: Vec<String>,
}

#[derive(Debug, Serialize)]
struct PlannedInsert {
    id: Id,
    entity_type: String,
    folded: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RenderedQuery {
    statement: SqlStatement,
    labels: Vec<String>,
}

fn read_json(path: &Path) -> Result<JsonValue> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn read_object(path: &Path) -> Result<Map<String, JsonValue>> {
    match read_json(path)? {
        JsonValue::Object(map) => Ok(map),
        _ => Err(anyhow!("{} must hold a JSON object", path.display())),
    }
}

fn read_model(path: &Path) -> Result<Model> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(Model::from_json(&raw)?)
}

fn check_model(path: &Path) -> Result<ModelSummary> {
    let model = read_model(path)?;
    let mut types = Vec::new();
    for def in model.entity_types() {
        let chain = model
            .type_chain(&def.name)?
            .into_iter()
            .map(|ancestor| ancestor.name.clone())
            .collect();
        let references = def
            .references
            .iter()
            .map(|reference| {
                let storage = match reference.storage {
                    StorageRule::ForeignKey => "fk",
                    StorageRule::InverseForeignKey => "inverse fk",
                    StorageRule::JoinTable => "join table",
                };
                let kind = if reference.containment { "contains" } else { "refers to" };
                format!("{} {kind} {} via {storage}", reference.name, reference.target)
            })
            .collect();
        types.push(TypeSummary {
            name: def.name.clone(),
            table: def.table.clone(),
            chain,
            attributes: def.attributes.len(),
            references,
        });
    }
    Ok(ModelSummary {
        version: model.version().map(str::to_string),
        types,
    })
}

fn plan_create(args: &PlanCreateArgs) -> Result<CreatePlan> {
    let model = read_model(&args.model)?;
    let source = read_object(&args.payload)?;
    let identifiers = UuidIdentifierProvider::default();
    let coercer = DefaultCoercer;
    let ctx = ProcessorContext::new(&model, &identifiers, &coercer);
    let (created, statements) = InsertPayloadProcessor::new(ctx).insert(&args.entity_type, &source)?;
    let set = StatementSet::from(statements);
    let plan = DependencyResolver::new(&model).plan(&set.inserts, &set.add_references)?;

    let inserts = plan
        .order
        .iter()
        .map(|index| {
            let instance = &set.inserts[*index].instance;
            let folded = plan
                .folded
                .get(&instance.id)
                .into_iter()
                .flatten()
                .map(|column| format!("{}.{} = {}", column.table, column.column, column.value))
                .collect();
            PlannedInsert {
                id: instance.id,
                entity_type: instance.entity_type.clone(),
                folded,
            }
        })
        .collect();
    let deferred_links = plan
        .deferred
        .iter()
        .flat_map(|link| {
            link.referenced_ids
                .iter()
                .map(move |target| format!("{} {} -> {target}", link.reference, link.id))
        })
        .collect();
    Ok(CreatePlan {
        created,
        inserts,
        exists_checks: set.exists_checks.len(),
        deferred_links,
    })
}

fn render_query(args: &RenderQueryArgs) -> Result<RenderedQuery> {
    let model = read_model(&args.model)?;
    let query: LogicalQuery = serde_json::from_value(read_json(&args.query)?)
        .with_context(|| format!("failed to parse query {}", args.query.display()))?;
    let params = match &args.params {
        Some(path) => read_object(path)?,
        None => Map::new(),
    };
    let dialect = Dialect::from(args.dialect);
    let columns = ColumnNames::default();
    let built = QueryBuilder::new(&model, &columns, dialect).build(&query, &params)?;
    Ok(RenderedQuery {
        statement: built.to_sql(dialect),
        labels: built.labels,
    })
}

fn create(args: &CreateArgs) -> Result<JsonValue> {
    let config = load_or_init_config(&args.datastore)?;
    let model = load_model(&config, &args.datastore)?;
    let conn = open_sqlite(&config, &args.datastore)?;
    let source = read_object(&args.payload)?;

    let executor = SqliteExecutor::new(&conn);
    let identifiers = UuidIdentifierProvider::default();
    let coercer = DefaultCoercer;
    let tx = conn.unchecked_transaction().context("failed to begin transaction")?;
    let created = PayloadDao::new(&executor, &model, &identifiers, &coercer)
        .with_config(&config)
        .create(&args.entity_type, &source)?;
    tx.commit().context("failed to commit")?;
    Ok(JsonValue::Object(created))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_model() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .expect("repo root")
            .join("fixtures/commerce_model.json")
    }

    #[test]
    fn cli_parses_render_query_defaults() {
        let cli = Cli::parse_from(["xtask", "render-query", "--model", "m.json", "--query", "q.json"]);
        match cli.command {
            Command::RenderQuery(args) => {
                assert_eq!(args.model, PathBuf::from("m.json"));
                assert!(args.params.is_none());
                assert_eq!(args.dialect, DialectArg::Sqlite);
            }
            _ => panic!("expected render-query command"),
        }
    }

    #[test]
    fn check_model_summarizes_the_fixture() {
        let summary = check_model(&fixture_model()).expect("summary");
        assert_eq!(summary.version.as_deref(), Some("commerce-1"));
        let customer = summary
            .types
            .iter()
            .find(|def| def.name == "Customer")
            .expect("customer");
        assert_eq!(customer.chain, vec!["Customer", "Party"]);
        assert_eq!(customer.references, vec!["orders refers to Order via inverse fk"]);
    }

    #[test]
    fn plan_create_orders_shipment_before_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let payload = dir.path().join("order.json");
        fs::write(
            &payload,
            serde_json::json!({
                "order_number": "A-1",
                "customer": {"__identifier": Id::new().to_string()},
                "shipment": {"carrier": "DHL"}
            })
            .to_string(),
        )
        .expect("write payload");
        let plan = plan_create(&PlanCreateArgs {
            model: fixture_model(),
            entity_type: "Order".into(),
            payload,
        })
        .expect("plan");
        let order: Vec<_> = plan.inserts.iter().map(|insert| insert.entity_type.as_str()).collect();
        assert_eq!(order, vec!["Shipment", "Order"]);
        assert_eq!(plan.inserts[1].folded.len(), 2);
        assert_eq!(plan.exists_checks, 1);
    }

    #[test]
    fn render_query_emits_positional_parameters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let query = dir.path().join("query.json");
        fs::write(
            &query,
            serde_json::json!({
                "entity_type": "Order",
                "select": [{"alias": "t0", "member": "order_number"}],
                "filters": [{"alias": "t0", "member": "order_number", "op": "eq",
                             "value": {"literal": "A-1"}}]
            })
            .to_string(),
        )
        .expect("write query");
        let rendered = render_query(&RenderQueryArgs {
            model: fixture_model(),
            query,
            params: None,
            dialect: DialectArg::Postgres,
        })
        .expect("render");
        assert!(rendered.statement.sql.contains("$1"), "{}", rendered.statement.sql);
        assert_eq!(rendered.statement.values.len(), 1);
        assert_eq!(rendered.labels, vec!["__identifier", "__entityType", "order_number"]);
    }
}
