pub mod checker;
pub mod collector;
pub mod config;
pub mod dao;
pub mod datastore;
pub mod dependency;
pub mod executor;
pub mod query;
pub mod sql;
pub mod sqlite;

pub use checker::ReferenceConsistencyChecker;
pub use collector::SqlInstanceGraphCollector;
pub use config::{ColumnNames, DatabaseConfig, TaxisConfig, WriteConfig};
pub use dao::PayloadDao;
pub use datastore::{default_sqlite_path, load_model, load_or_init_config, open_sqlite};
pub use dependency::{DependencyResolver, FoldedColumn, InsertPlan, RdbmsReference};
pub use executor::{
    DeleteExecutor, ExecutionReport, InsertExecutor, ReferenceExecutor, StatementExecutor,
    StoreContext, UpdateExecutor,
};
pub use query::{
    CompareOp, Condition, Filter, FilterValue, Join, JoinKind, JoinResolver, JoinRole, LogicalQuery,
    MemberOrder, OrderField, QueryBuildContext, QueryBuilder, RdbmsJoin, SelectField, SelectQuery,
};
pub use sql::{Dialect, Row, SqlExecutor, SqlStatement};
pub use sqlite::SqliteExecutor;
