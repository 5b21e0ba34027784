//! Destination stores for assembled geometries.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;

use crate::geom::AssembledWay;

/// Connection settings of the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub driver: String,
    pub connection: String,
    pub srid: u32,
    pub schema: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub ty: String,
}

impl ColumnSpec {
    pub fn new(name: &str, ty: &str) -> Self {
        Self {
            name: name.to_owned(),
            ty: ty.to_owned(),
        }
    }
}

/// One destination table: `osm_id`, the tag columns, and a geometry column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    pub schema: String,
    pub columns: Vec<ColumnSpec>,
    pub geometry_type: String,
    pub srid: u32,
}

impl TableSpec {
    /// The default line table: `name` and `highway` as text columns.
    pub fn lines(name: &str, config: &DbConfig) -> Self {
        Self {
            name: name.to_owned(),
            schema: config.schema.clone(),
            columns: vec![
                ColumnSpec::new("name", "VARCHAR"),
                ColumnSpec::new("highway", "VARCHAR"),
            ],
            geometry_type: "LINESTRING".to_owned(),
            srid: config.srid,
        }
    }

    /// Tag values for each column, in column order.
    pub fn values<'a>(&self, way: &'a AssembledWay) -> Vec<Option<&'a str>> {
        self.columns
            .iter()
            .map(|c| way.way.tags.get(&c.name).map(String::as_str))
            .collect()
    }
}

pub trait GeometryStore: Send + Sync {
    /// Creates the schema if missing and (re)creates every table empty.
    fn init(&self, specs: &[TableSpec]) -> Result<()>;

    /// Inserts a batch in one transaction. Returns the number of rows written.
    fn insert_ways(&self, ways: &[AssembledWay], spec: &TableSpec) -> Result<usize>;
}

/// Fails unless `driver` names a destination compiled into this build.
pub fn check_driver(driver: &str) -> Result<()> {
    match driver {
        #[cfg(feature = "postgres")]
        "postgres" => Ok(()),
        other => bail!("unsupported database driver {other:?}"),
    }
}

/// Opens the store named by `config.driver`.
pub fn open(config: &DbConfig) -> Result<Box<dyn GeometryStore>> {
    match config.driver.as_str() {
        #[cfg(feature = "postgres")]
        "postgres" => Ok(Box::new(postgres::PostgresStore::connect(config)?)),
        other => bail!("unsupported database driver {other:?}"),
    }
}

/// A row as kept by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub osm_id: i64,
    pub values: Vec<Option<String>>,
    pub wkb: Vec<u8>,
}

/// Keeps rows in memory, keyed by `schema.table`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Vec<StoredRow>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self, spec: &TableSpec) -> Vec<StoredRow> {
        self.tables
            .lock()
            .get(&qualified(spec))
            .cloned()
            .unwrap_or_default()
    }
}

fn qualified(spec: &TableSpec) -> String {
    format!("{}.{}", spec.schema, spec.name)
}

impl GeometryStore for MemoryStore {
    fn init(&self, specs: &[TableSpec]) -> Result<()> {
        let mut tables = self.tables.lock();
        for spec in specs {
            tables.insert(qualified(spec), Vec::new());
        }
        Ok(())
    }

    fn insert_ways(&self, ways: &[AssembledWay], spec: &TableSpec) -> Result<usize> {
        let mut tables = self.tables.lock();
        let rows = tables
            .get_mut(&qualified(spec))
            .with_context(|| format!("table {} was not initialized", qualified(spec)))?;
        rows.extend(ways.iter().map(|w| StoredRow {
            osm_id: w.way.id,
            values: spec
                .values(w)
                .into_iter()
                .map(|v| v.map(str::to_owned))
                .collect(),
            wkb: w.wkb.clone(),
        }));
        Ok(ways.len())
    }
}

#[cfg(feature = "postgres")]
pub mod postgres {
    use anyhow::{Context, Result};
    use sqlx::postgres::{PgPool, PgPoolOptions};
    use sqlx::{Postgres, QueryBuilder};
    use tokio::runtime::Runtime;

    use super::{DbConfig, GeometryStore, TableSpec};
    use crate::geom::AssembledWay;

    /// PostgreSQL limits a statement to this many bind parameters.
    const MAX_BINDS: usize = 65_535;

    /// PostGIS destination. Calls block on a private runtime, so the store can
    /// be used from plain worker threads.
    pub struct PostgresStore {
        runtime: Runtime,
        pool: PgPool,
    }

    impl PostgresStore {
        pub fn connect(config: &DbConfig) -> Result<Self> {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("postgres")
                .enable_all()
                .build()
                .context("building database runtime")?;
            let pool = runtime
                .block_on(
                    PgPoolOptions::new()
                        .max_connections(16)
                        .connect(&config.connection),
                )
                .context("connecting to PostgreSQL")?;
            log::info!("connected to PostgreSQL");
            Ok(Self { runtime, pool })
        }

        async fn init_table(&self, spec: &TableSpec) -> Result<()> {
            let table = table_name(spec);
            sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                .execute(&self.pool)
                .await
                .with_context(|| format!("dropping {table}"))?;

            let mut columns = String::from("id SERIAL PRIMARY KEY, osm_id BIGINT");
            for col in &spec.columns {
                columns.push_str(&format!(", {} {}", quote_ident(&col.name), col.ty));
            }
            sqlx::query(&format!("CREATE TABLE {table} ({columns})"))
                .execute(&self.pool)
                .await
                .with_context(|| format!("creating {table}"))?;

            sqlx::query("SELECT AddGeometryColumn($1, $2, 'geometry', $3, $4, 2)")
                .bind(&spec.schema)
                .bind(&spec.name)
                .bind(spec.srid as i32)
                .bind(&spec.geometry_type)
                .execute(&self.pool)
                .await
                .with_context(|| format!("adding geometry column to {table}"))?;
            log::info!("created table {table}");
            Ok(())
        }

        async fn insert(&self, ways: &[AssembledWay], spec: &TableSpec) -> Result<usize> {
            let table = table_name(spec);
            let mut head = format!("INSERT INTO {table} (osm_id");
            for col in &spec.columns {
                head.push_str(", ");
                head.push_str(&quote_ident(&col.name));
            }
            head.push_str(", geometry) ");

            let per_row = spec.columns.len() + 2;
            let rows_per_statement = (MAX_BINDS / per_row).max(1);

            let mut tx = self.pool.begin().await.context("starting insert")?;
            for chunk in ways.chunks(rows_per_statement) {
                let mut query: QueryBuilder<Postgres> = QueryBuilder::new(&head);
                query.push_values(chunk, |mut b, way| {
                    b.push_bind(way.way.id);
                    for (value, col) in spec.values(way).into_iter().zip(&spec.columns) {
                        b.push("CAST(")
                            .push_bind_unseparated(value.map(str::to_owned))
                            .push_unseparated(format!(" AS {})", col.ty));
                    }
                    b.push("ST_GeomFromWKB(")
                        .push_bind_unseparated(way.wkb.clone())
                        .push_unseparated(format!(", {})", spec.srid));
                });
                query
                    .build()
                    .execute(&mut *tx)
                    .await
                    .with_context(|| format!("inserting into {table}"))?;
            }
            tx.commit().await.context("committing insert")?;
            Ok(ways.len())
        }
    }

    impl GeometryStore for PostgresStore {
        fn init(&self, specs: &[TableSpec]) -> Result<()> {
            self.runtime.block_on(async {
                for spec in specs {
                    sqlx::query(&format!(
                        "CREATE SCHEMA IF NOT EXISTS {}",
                        quote_ident(&spec.schema)
                    ))
                    .execute(&self.pool)
                    .await
                    .with_context(|| format!("creating schema {}", spec.schema))?;
                    self.init_table(spec).await?;
                }
                Ok::<(), anyhow::Error>(())
            })
        }

        fn insert_ways(&self, ways: &[AssembledWay], spec: &TableSpec) -> Result<usize> {
            if ways.is_empty() {
                return Ok(0);
            }
            self.runtime.block_on(self.insert(ways, spec))
        }
    }

    fn quote_ident(ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn table_name(spec: &TableSpec) -> String {
        format!("{}.{}", quote_ident(&spec.schema), quote_ident(&spec.name))
    }

}
