//! Relational driver over the sqlx `Any` pool
//!
//! One table per entity, child rows pointing at their parent by id. Ids
//! are assigned here, inside the ingest transaction, so every dialect can
//! take multi-row INSERTs without RETURNING support.
//!
//! The public surface is synchronous: every method blocks on the driver's
//! own tokio runtime.

pub mod schema;
pub mod sql;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::str::FromStr;
use std::sync::RwLock;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use sqlx::any::{AnyConnectOptions, AnyPoolOptions, AnyRow};
use sqlx::{AnyConnection, AnyPool, ConnectOptions, Row};
use tokio::runtime::Runtime;

use self::schema::{
    Table, ADVISORIES, BUGZILLAS, COMPONENTS, CPES, CVES, DEBIANS, DEFINITIONS, FETCH_META, PACKAGES,
    REFERENCES, RESOLUTIONS, ROOTS,
};
use self::sql::{bind_all, in_list, placeholder, quote, Value};
use super::{bounded_chunk, filter, very_old, Dialect, OvalStore, Options, HOST_PARAM_CHUNK};
use crate::error::{OvalError, Result, ResultExt};
use crate::family;
use crate::models::{
    epoch_sentinel, Advisory, Bugzilla, Component, Cpe, Cve, Debian, Definition, FetchMeta, Package, Reference,
    Resolution, Root,
};

/// SQLITE_BUSY / SQLITE_LOCKED primary result codes
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

/// OVAL store on sqlite3, mysql or postgres
pub struct RdbDriver {
    dialect: Dialect,
    rt: Runtime,
    pool: RwLock<Option<AnyPool>>,
    options: Options,
}

/// sqlx URL for `conn`; a bare sqlite path becomes a read-write-create URL.
pub fn connection_url(dialect: Dialect, conn: &str) -> String {
    match dialect {
        Dialect::Sqlite3 if !conn.starts_with("sqlite:") => format!("sqlite://{}?mode=rwc", conn),
        _ => conn.to_string(),
    }
}

/// True for the embedded file database's busy / locked conditions.
fn is_sqlite_contention(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db) = err else {
        return false;
    };
    let primary = db
        .code()
        .and_then(|c| c.parse::<i64>().ok())
        .map(|c| c & 0xff);
    if matches!(primary, Some(SQLITE_BUSY) | Some(SQLITE_LOCKED)) {
        return true;
    }
    let msg = db.message().to_ascii_lowercase();
    msg.contains("locked") || msg.contains("busy")
}

fn classify(dialect: Dialect, err: OvalError) -> OvalError {
    match err {
        OvalError::Sql(ref e) if dialect == Dialect::Sqlite3 && is_sqlite_contention(e) => OvalError::Locked,
        other => other,
    }
}

impl RdbDriver {
    pub fn open(dialect: Dialect, conn: &str, debug: bool, options: &Options) -> Result<Self> {
        if !dialect.is_relational() {
            return Err(OvalError::UnsupportedDialect(dialect.to_string()));
        }
        sqlx::any::install_default_drivers();
        let rt = Runtime::new().op("start runtime")?;

        let mut connect = AnyConnectOptions::from_str(&connection_url(dialect, conn)).op("parse connection string")?;
        if !debug {
            connect = connect.disable_statement_logging();
        }

        let busy_ms = options.sqlite_busy_timeout.as_millis();
        let pool = rt
            .block_on(
                AnyPoolOptions::new()
                    .max_connections(options.max_connections.max(1))
                    .after_connect(move |conn, _meta| {
                        Box::pin(async move {
                            if dialect == Dialect::Sqlite3 {
                                sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                                let busy = format!("PRAGMA busy_timeout = {}", busy_ms);
                                sqlx::query(&busy).execute(&mut *conn).await?;
                            }
                            Ok(())
                        })
                    })
                    .connect_with(connect),
            )
            .map_err(|e| classify(dialect, e.into()))
            .op("open DB")?;

        tracing::debug!(dialect = %dialect, "relational driver opened");
        Ok(Self {
            dialect,
            rt,
            pool: RwLock::new(Some(pool)),
            options: options.clone(),
        })
    }

    fn pool(&self) -> Result<AnyPool> {
        self.pool
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(OvalError::Closed)
    }

    fn block_on<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.rt.block_on(fut).map_err(|e| classify(self.dialect, e))
    }

    fn lookup(&self, family: &str, ids_sql: String, params: Vec<Value>) -> Result<Vec<Definition>> {
        let pool = self.pool()?;
        let dialect = self.dialect;
        let family = family.to_string();
        self.block_on(async move {
            let mut conn = pool.acquire().await?;
            let ids = fetch_ids(&mut conn, &ids_sql, params).await?;
            load_definitions(&mut conn, dialect, &family, &ids).await
        })
    }
}

impl Drop for RdbDriver {
    fn drop(&mut self) {
        let pool = self.pool.get_mut().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pool) = pool {
            self.rt.block_on(pool.close());
        }
    }
}

impl OvalStore for RdbDriver {
    fn name(&self) -> &'static str {
        self.dialect.as_str()
    }

    fn is_legacy_v1(&self) -> Result<bool> {
        let pool = self.pool()?;
        let dialect = self.dialect;
        self.block_on(async move {
            let mut conn = pool.acquire().await?;
            schema::has_column(&mut conn, dialect, FETCH_META.name, schema::LEGACY_FETCH_META_COLUMN).await
        })
        .op("check schema version")
    }

    fn migrate(&self) -> Result<()> {
        let pool = self.pool()?;
        let dialect = self.dialect;
        self.block_on(async move {
            let mut conn = pool.acquire().await?;
            schema::migrate(&mut conn, dialect).await
        })
        .op("migrate")
    }

    fn close(&self) -> Result<()> {
        let taken = self.pool.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pool) = taken {
            self.rt.block_on(pool.close());
        }
        Ok(())
    }

    fn fetch_meta(&self) -> Result<FetchMeta> {
        let pool = self.pool()?;
        let row = self
            .block_on(async move {
                Ok::<_, OvalError>(sqlx::query("SELECT revision, schema_version, last_fetched_at FROM fetch_meta ORDER BY id LIMIT 1")
                    .fetch_optional(&pool)
                    .await?)
            })
            .op("get FetchMeta")?;

        let Some(row) = row else {
            return Ok(FetchMeta::default());
        };
        Ok(FetchMeta {
            revision: text(&row, 0)?,
            schema_version: int(&row, 1)? as u32,
            last_fetched_at: parse_time(&text(&row, 2)?),
        })
    }

    fn upsert_fetch_meta(&self, meta: &FetchMeta) -> Result<()> {
        let pool = self.pool()?;
        let dialect = self.dialect;
        let current = FetchMeta::new(meta.last_fetched_at);
        self.block_on(async move {
            let mut tx = pool.begin().await?;
            let existing = sqlx::query("SELECT id FROM fetch_meta ORDER BY id LIMIT 1")
                .fetch_optional(&mut *tx)
                .await?;
            let values: Vec<Value> = vec![
                current.revision.clone().into(),
                (current.schema_version as i64).into(),
                format_time(&current.last_fetched_at).into(),
            ];

            match existing {
                Some(row) => {
                    let id = int(&row, 0)?;
                    let sql = format!(
                        "UPDATE fetch_meta SET revision = {}, schema_version = {}, last_fetched_at = {} WHERE id = {}",
                        placeholder(dialect, 1),
                        placeholder(dialect, 2),
                        placeholder(dialect, 3),
                        placeholder(dialect, 4)
                    );
                    let mut values = values;
                    values.push(id.into());
                    bind_all(sqlx::query(&sql), values).execute(&mut *tx).await?;
                }
                None => {
                    let mut row = vec![Value::Int(1)];
                    row.extend(values);
                    insert_rows(&mut tx, dialect, &FETCH_META, vec![row], 1).await?;
                }
            }
            tx.commit().await?;
            Ok::<_, OvalError>(())
        })
        .op("upsert FetchMeta")
    }

    fn count_defs(&self, family: &str, version: &str) -> Result<usize> {
        let (f, v) = family::canonicalize(family, version)?;
        let pool = self.pool()?;
        let sql = format!(
            "SELECT COUNT(*) FROM definitions JOIN roots ON roots.id = definitions.root_id \
             WHERE roots.family = {} AND roots.os_version = {}",
            placeholder(self.dialect, 1),
            placeholder(self.dialect, 2)
        );
        let (fb, vb) = (f.clone(), v.clone());
        let n = self
            .block_on(async move {
                let row = sqlx::query(&sql).bind(fb).bind(vb).fetch_one(&pool).await?;
                int(&row, 0)
            })
            .context("count definitions", &f, &v)?;
        Ok(n.max(0) as usize)
    }

    fn last_modified(&self, family: &str, version: &str) -> Result<DateTime<Utc>> {
        let (f, v) = family::canonicalize(family, version)?;
        let pool = self.pool()?;
        let sql = format!(
            "SELECT {} FROM roots WHERE family = {} AND os_version = {} ORDER BY id DESC LIMIT 1",
            quote(self.dialect, "timestamp"),
            placeholder(self.dialect, 1),
            placeholder(self.dialect, 2)
        );
        let (fb, vb) = (f.clone(), v.clone());
        let raw = self
            .block_on(async move {
                match sqlx::query(&sql).bind(fb).bind(vb).fetch_optional(&pool).await? {
                    Some(row) => Ok::<_, OvalError>(Some(text(&row, 0)?)),
                    None => Ok(None),
                }
            })
            .context("get last modified", &f, &v)?;

        Ok(raw.map(|s| parse_time(&s)).unwrap_or_else(very_old))
    }

    fn insert_root(&self, root: &Root) -> Result<()> {
        let batch = self.options.checked_batch_size()?;
        let (f, v) = family::canonicalize(&root.family, &root.os_version)?;
        let pool = self.pool()?;
        let dialect = self.dialect;
        tracing::info!(family = %f, version = %v, "Refreshing...");

        let (fb, vb) = (f.clone(), v.clone());
        self.block_on(async move {
            let mut tx = pool.begin().await?;
            replace_root(&mut tx, dialect, &fb, &vb, root, bounded_chunk(batch)).await?;
            tx.commit().await?;
            Ok::<_, OvalError>(())
        })
        .context("insert OVAL", &f, &v)
    }

    fn get_by_package_name(&self, family: &str, version: &str, package: &str, arch: &str) -> Result<Vec<Definition>> {
        let (f, v) = family::canonicalize(family, version)?;
        let d = self.dialect;
        let mut sql = format!(
            "SELECT DISTINCT definitions.id FROM definitions \
             JOIN roots ON roots.id = definitions.root_id \
             JOIN packages ON packages.definition_id = definitions.id \
             WHERE roots.family = {} AND roots.os_version = {} AND packages.name = {}",
            placeholder(d, 1),
            placeholder(d, 2),
            placeholder(d, 3)
        );
        let mut params: Vec<Value> = vec![f.as_str().into(), v.as_str().into(), package.into()];
        if family::filters_by_arch(&f) && !arch.is_empty() {
            sql.push_str(&format!(" AND packages.arch = {}", placeholder(d, 4)));
            params.push(arch.into());
        }

        let defs = self
            .lookup(&f, sql, params)
            .context("get definitions by package name", &f, &v)?;
        Ok(filter::shape_package_lookup(&f, &v, package, arch, defs))
    }

    fn get_by_cve_id(&self, family: &str, version: &str, cve_id: &str, arch: &str) -> Result<Vec<Definition>> {
        let (f, v) = family::canonicalize(family, version)?;
        let d = self.dialect;
        let sql = format!(
            "SELECT DISTINCT definitions.id FROM definitions \
             JOIN roots ON roots.id = definitions.root_id \
             JOIN advisories ON advisories.definition_id = definitions.id \
             JOIN cves ON cves.advisory_id = advisories.id \
             WHERE roots.family = {} AND roots.os_version = {} AND cves.cve_id = {}",
            placeholder(d, 1),
            placeholder(d, 2),
            placeholder(d, 3)
        );
        let params: Vec<Value> = vec![f.as_str().into(), v.as_str().into(), cve_id.into()];

        let defs = self
            .lookup(&f, sql, params)
            .context("get definitions by CVE ID", &f, &v)?;
        Ok(filter::shape_cve_lookup(&f, &v, arch, defs))
    }

    fn get_advisories(&self, family: &str, version: &str) -> Result<HashMap<String, Vec<String>>> {
        let (f, v) = family::canonicalize(family, version)?;
        let d = self.dialect;
        let sql = format!(
            "SELECT definitions.id FROM definitions \
             JOIN roots ON roots.id = definitions.root_id \
             WHERE roots.family = {} AND roots.os_version = {}",
            placeholder(d, 1),
            placeholder(d, 2)
        );
        let params: Vec<Value> = vec![f.as_str().into(), v.as_str().into()];

        let defs = self.lookup(&f, sql, params).context("get advisories", &f, &v)?;
        Ok(filter::advisory_map(&f, &defs))
    }
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_time(s: &str) -> DateTime<Utc> {
    match DateTime::parse_from_rfc3339(s) {
        Ok(t) => t.with_timezone(&Utc),
        Err(e) => {
            if !s.is_empty() {
                tracing::warn!(value = %s, error = %e, "unparsable stored timestamp");
            }
            epoch_sentinel()
        }
    }
}

/// Text column; MySQL may hand long text back as bytes.
fn text(row: &AnyRow, idx: usize) -> Result<String> {
    match row.try_get::<Option<String>, _>(idx) {
        Ok(v) => Ok(v.unwrap_or_default()),
        Err(_) => Ok(row
            .try_get::<Option<Vec<u8>>, _>(idx)?
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default()),
    }
}

fn int(row: &AnyRow, idx: usize) -> Result<i64> {
    Ok(row.try_get::<Option<i64>, _>(idx)?.unwrap_or(0))
}

async fn fetch_ids(conn: &mut AnyConnection, sql: &str, params: Vec<Value>) -> Result<Vec<i64>> {
    let rows = bind_all(sqlx::query(sql), params).fetch_all(&mut *conn).await?;
    rows.iter().map(|r| int(r, 0)).collect()
}

/// Run `prefix IN (...) ORDER BY id` for one chunk of ids.
async fn fetch_in(conn: &mut AnyConnection, dialect: Dialect, prefix: &str, ids: &[i64]) -> Result<Vec<AnyRow>> {
    let sql = format!("{} IN {} ORDER BY id", prefix, in_list(dialect, 1, ids.len()));
    let params = ids.iter().map(|&i| Value::Int(i)).collect();
    Ok(bind_all(sqlx::query(&sql), params).fetch_all(&mut *conn).await?)
}

async fn select_ids_in(
    conn: &mut AnyConnection,
    dialect: Dialect,
    table: &Table,
    column: &str,
    ids: &[i64],
) -> Result<Vec<i64>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = sql::select_ids_in_statement(dialect, table.name, column, ids.len());
    fetch_ids(conn, &sql, ids.iter().map(|&i| Value::Int(i)).collect()).await
}

async fn delete_in(conn: &mut AnyConnection, dialect: Dialect, table: &Table, column: &str, ids: &[i64]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let sql = sql::delete_in_statement(dialect, table.name, column, ids.len());
    let params = ids.iter().map(|&i| Value::Int(i)).collect();
    bind_all(sqlx::query(&sql), params).execute(&mut *conn).await?;
    Ok(())
}

async fn insert_rows(
    conn: &mut AnyConnection,
    dialect: Dialect,
    table: &Table,
    rows: Vec<Vec<Value>>,
    batch: usize,
) -> Result<()> {
    let columns = table.column_names();
    let per_statement = sql::rows_per_statement(columns.len(), batch);
    let mut rows = rows.into_iter().peekable();
    while rows.peek().is_some() {
        let chunk: Vec<Vec<Value>> = rows.by_ref().take(per_statement).collect();
        let stmt = sql::insert_statement(dialect, table.name, &columns, chunk.len());
        let values = chunk.into_iter().flatten().collect();
        bind_all(sqlx::query(&stmt), values).execute(&mut *conn).await?;
    }
    Ok(())
}

/// Remove a root and everything hanging off it, children first.
async fn delete_snapshot(conn: &mut AnyConnection, dialect: Dialect, root_id: i64, chunk: usize) -> Result<()> {
    let sql = format!("SELECT id FROM definitions WHERE root_id = {}", placeholder(dialect, 1));
    let def_ids = fetch_ids(conn, &sql, vec![Value::Int(root_id)]).await?;
    tracing::info!(count = def_ids.len(), "Deleting old definitions");

    for defs in def_ids.chunks(chunk) {
        let adv_ids = select_ids_in(conn, dialect, &ADVISORIES, "definition_id", defs).await?;
        for advs in adv_ids.chunks(chunk) {
            let res_ids = select_ids_in(conn, dialect, &RESOLUTIONS, "advisory_id", advs).await?;
            for res in res_ids.chunks(chunk) {
                delete_in(conn, dialect, &COMPONENTS, "resolution_id", res).await?;
            }
            for table in [&RESOLUTIONS, &CVES, &BUGZILLAS, &CPES] {
                delete_in(conn, dialect, table, "advisory_id", advs).await?;
            }
            delete_in(conn, dialect, &ADVISORIES, "id", advs).await?;
        }
        for table in [&PACKAGES, &REFERENCES, &DEBIANS] {
            delete_in(conn, dialect, table, "definition_id", defs).await?;
        }
        delete_in(conn, dialect, &DEFINITIONS, "id", defs).await?;
        tracing::debug!(deleted = defs.len(), "definition chunk deleted");
    }

    delete_in(conn, dialect, &ROOTS, "id", &[root_id]).await
}

/// Next free id per table, read once per ingest transaction
struct IdSeq(HashMap<&'static str, i64>);

impl IdSeq {
    async fn load(conn: &mut AnyConnection, dialect: Dialect) -> Result<Self> {
        let mut next = HashMap::new();
        for table in schema::TABLES.iter().filter(|t| t.name != FETCH_META.name) {
            let sql = format!("SELECT COALESCE(MAX(id), 0) FROM {}", quote(dialect, table.name));
            let row = sqlx::query(&sql).fetch_one(&mut *conn).await?;
            next.insert(table.name, int(&row, 0)? + 1);
        }
        Ok(Self(next))
    }

    fn next(&mut self, table: &Table) -> i64 {
        let slot = self.0.entry(table.name).or_insert(1);
        let id = *slot;
        *slot += 1;
        id
    }
}

/// Rows for one chunk of definitions, grouped by table
#[derive(Default)]
struct PendingRows {
    definitions: Vec<Vec<Value>>,
    advisories: Vec<Vec<Value>>,
    cves: Vec<Vec<Value>>,
    bugzillas: Vec<Vec<Value>>,
    resolutions: Vec<Vec<Value>>,
    components: Vec<Vec<Value>>,
    cpes: Vec<Vec<Value>>,
    packages: Vec<Vec<Value>>,
    references: Vec<Vec<Value>>,
    debians: Vec<Vec<Value>>,
}

impl PendingRows {
    fn push_definition(&mut self, ids: &mut IdSeq, root_id: i64, def: &Definition) {
        let def_id = ids.next(&DEFINITIONS);
        self.definitions.push(vec![
            def_id.into(),
            root_id.into(),
            def.definition_id.as_str().into(),
            def.title.as_str().into(),
            def.description.as_str().into(),
        ]);

        let adv = &def.advisory;
        let adv_id = ids.next(&ADVISORIES);
        self.advisories.push(vec![
            adv_id.into(),
            def_id.into(),
            adv.severity.as_str().into(),
            format_time(&adv.issued).into(),
            format_time(&adv.updated).into(),
        ]);
        for c in &adv.cves {
            self.cves.push(vec![
                ids.next(&CVES).into(),
                adv_id.into(),
                c.cve_id.as_str().into(),
                c.cvss2.as_str().into(),
                c.cvss3.as_str().into(),
                c.cwe.as_str().into(),
                c.impact.as_str().into(),
                c.href.as_str().into(),
                c.public.as_str().into(),
            ]);
        }
        for b in &adv.bugzillas {
            self.bugzillas.push(vec![
                ids.next(&BUGZILLAS).into(),
                adv_id.into(),
                b.bugzilla_id.as_str().into(),
                b.url.as_str().into(),
                b.title.as_str().into(),
            ]);
        }
        for r in &adv.affected_resolution {
            let res_id = ids.next(&RESOLUTIONS);
            self.resolutions
                .push(vec![res_id.into(), adv_id.into(), r.state.as_str().into()]);
            for c in &r.components {
                self.components
                    .push(vec![ids.next(&COMPONENTS).into(), res_id.into(), c.component.as_str().into()]);
            }
        }
        for c in &adv.affected_cpe_list {
            self.cpes
                .push(vec![ids.next(&CPES).into(), adv_id.into(), c.cpe.as_str().into()]);
        }

        for p in &def.affected_packs {
            self.packages.push(vec![
                ids.next(&PACKAGES).into(),
                def_id.into(),
                p.name.as_str().into(),
                p.version.as_str().into(),
                p.arch.as_str().into(),
                p.not_fixed_yet.into(),
                p.modularity_label.as_str().into(),
            ]);
        }
        for r in &def.references {
            self.references.push(vec![
                ids.next(&REFERENCES).into(),
                def_id.into(),
                r.source.as_str().into(),
                r.ref_id.as_str().into(),
                r.ref_url.as_str().into(),
            ]);
        }
        if let Some(deb) = &def.debian {
            self.debians
                .push(vec![ids.next(&DEBIANS).into(), def_id.into(), deb.dsa.as_str().into()]);
        }
    }

    /// Insert parents before children.
    async fn write(self, conn: &mut AnyConnection, dialect: Dialect, batch: usize) -> Result<()> {
        let ordered: [(&Table, Vec<Vec<Value>>); 10] = [
            (&DEFINITIONS, self.definitions),
            (&ADVISORIES, self.advisories),
            (&CVES, self.cves),
            (&BUGZILLAS, self.bugzillas),
            (&RESOLUTIONS, self.resolutions),
            (&COMPONENTS, self.components),
            (&CPES, self.cpes),
            (&PACKAGES, self.packages),
            (&REFERENCES, self.references),
            (&DEBIANS, self.debians),
        ];
        for (table, rows) in ordered {
            insert_rows(conn, dialect, table, rows, batch).await?;
        }
        Ok(())
    }
}

async fn replace_root(
    conn: &mut AnyConnection,
    dialect: Dialect,
    family: &str,
    version: &str,
    root: &Root,
    chunk: usize,
) -> Result<()> {
    let sql = format!(
        "SELECT id FROM roots WHERE family = {} AND os_version = {}",
        placeholder(dialect, 1),
        placeholder(dialect, 2)
    );
    let old_roots = fetch_ids(conn, &sql, vec![family.into(), version.into()]).await?;
    for old in old_roots {
        delete_snapshot(conn, dialect, old, chunk).await?;
    }

    let mut ids = IdSeq::load(conn, dialect).await?;
    let root_id = ids.next(&ROOTS);
    let root_row: Vec<Value> = vec![
        root_id.into(),
        family.into(),
        version.into(),
        // whole seconds, as the KV store keeps it
        format_time(&root.timestamp.trunc_subsecs(0)).into(),
    ];
    insert_rows(conn, dialect, &ROOTS, vec![root_row], 1).await?;

    let unique = filter::first_occurrences(&root.definitions);

    tracing::info!(count = unique.len(), "Inserting new definitions");
    for defs in unique.chunks(chunk) {
        let mut pending = PendingRows::default();
        for def in defs {
            pending.push_definition(&mut ids, root_id, def);
        }
        pending.write(conn, dialect, chunk).await?;
        tracing::debug!(inserted = defs.len(), "definition chunk inserted");
    }
    Ok(())
}

/// Materialize definitions `ids` with every owned row.
async fn load_definitions(
    conn: &mut AnyConnection,
    dialect: Dialect,
    family: &str,
    ids: &[i64],
) -> Result<Vec<Definition>> {
    let refs = quote(dialect, REFERENCES.name);
    let mut defs: BTreeMap<i64, Definition> = BTreeMap::new();

    for chunk in ids.chunks(HOST_PARAM_CHUNK) {
        for row in fetch_in(conn, dialect, "SELECT id, definition_id, title, description FROM definitions WHERE id", chunk).await? {
            defs.insert(
                int(&row, 0)?,
                Definition {
                    definition_id: text(&row, 1)?,
                    title: text(&row, 2)?,
                    description: text(&row, 3)?,
                    ..Default::default()
                },
            );
        }

        let mut adv_owner: HashMap<i64, i64> = HashMap::new();
        let adv_sql = "SELECT id, definition_id, severity, issued, updated FROM advisories WHERE definition_id";
        for row in fetch_in(conn, dialect, adv_sql, chunk).await? {
            let (adv_id, def_id) = (int(&row, 0)?, int(&row, 1)?);
            if let Some(def) = defs.get_mut(&def_id) {
                def.advisory = Advisory {
                    severity: text(&row, 2)?,
                    issued: parse_time(&text(&row, 3)?),
                    updated: parse_time(&text(&row, 4)?),
                    ..Default::default()
                };
                adv_owner.insert(adv_id, def_id);
            }
        }

        let adv_ids: Vec<i64> = {
            let mut v: Vec<i64> = adv_owner.keys().copied().collect();
            v.sort_unstable();
            v
        };
        for advs in adv_ids.chunks(HOST_PARAM_CHUNK) {
            load_advisory_children(conn, dialect, advs, &adv_owner, &mut defs).await?;
        }

        let pkg_sql = "SELECT definition_id, name, version, arch, not_fixed_yet, modularity_label FROM packages WHERE definition_id";
        for row in fetch_in(conn, dialect, pkg_sql, chunk).await? {
            if let Some(def) = defs.get_mut(&int(&row, 0)?) {
                def.affected_packs.push(Package {
                    name: text(&row, 1)?,
                    version: text(&row, 2)?,
                    arch: text(&row, 3)?,
                    not_fixed_yet: int(&row, 4)? != 0,
                    modularity_label: text(&row, 5)?,
                });
            }
        }

        let ref_sql = format!("SELECT definition_id, source, ref_id, ref_url FROM {} WHERE definition_id", refs);
        for row in fetch_in(conn, dialect, &ref_sql, chunk).await? {
            if let Some(def) = defs.get_mut(&int(&row, 0)?) {
                def.references
                    .push(Reference::new(text(&row, 1)?, text(&row, 2)?, text(&row, 3)?));
            }
        }

        for row in fetch_in(conn, dialect, "SELECT definition_id, dsa FROM debians WHERE definition_id", chunk).await? {
            if let Some(def) = defs.get_mut(&int(&row, 0)?) {
                def.debian = Some(Debian { dsa: text(&row, 1)? });
            }
        }
    }

    tracing::debug!(family = %family, loaded = defs.len(), "definitions loaded");
    Ok(defs.into_values().collect())
}

fn owner_of<'a>(
    defs: &'a mut BTreeMap<i64, Definition>,
    adv_owner: &HashMap<i64, i64>,
    adv_id: i64,
) -> Option<&'a mut Advisory> {
    adv_owner
        .get(&adv_id)
        .and_then(|def_id| defs.get_mut(def_id))
        .map(|d| &mut d.advisory)
}

async fn load_advisory_children(
    conn: &mut AnyConnection,
    dialect: Dialect,
    advs: &[i64],
    adv_owner: &HashMap<i64, i64>,
    defs: &mut BTreeMap<i64, Definition>,
) -> Result<()> {
    let cve_sql = "SELECT advisory_id, cve_id, cvss2, cvss3, cwe, impact, href, public FROM cves WHERE advisory_id";
    for row in fetch_in(conn, dialect, cve_sql, advs).await? {
        if let Some(adv) = owner_of(defs, adv_owner, int(&row, 0)?) {
            adv.cves.push(Cve {
                cve_id: text(&row, 1)?,
                cvss2: text(&row, 2)?,
                cvss3: text(&row, 3)?,
                cwe: text(&row, 4)?,
                impact: text(&row, 5)?,
                href: text(&row, 6)?,
                public: text(&row, 7)?,
            });
        }
    }

    let bz_sql = "SELECT advisory_id, bugzilla_id, url, title FROM bugzillas WHERE advisory_id";
    for row in fetch_in(conn, dialect, bz_sql, advs).await? {
        if let Some(adv) = owner_of(defs, adv_owner, int(&row, 0)?) {
            adv.bugzillas.push(Bugzilla {
                bugzilla_id: text(&row, 1)?,
                url: text(&row, 2)?,
                title: text(&row, 3)?,
            });
        }
    }

    for row in fetch_in(conn, dialect, "SELECT advisory_id, cpe FROM cpes WHERE advisory_id", advs).await? {
        if let Some(adv) = owner_of(defs, adv_owner, int(&row, 0)?) {
            adv.affected_cpe_list.push(Cpe { cpe: text(&row, 1)? });
        }
    }

    // resolution id -> (advisory id, position in AffectedResolution)
    let mut res_owner: HashMap<i64, (i64, usize)> = HashMap::new();
    for row in fetch_in(conn, dialect, "SELECT id, advisory_id, state FROM resolutions WHERE advisory_id", advs).await? {
        let (res_id, adv_id) = (int(&row, 0)?, int(&row, 1)?);
        if let Some(adv) = owner_of(defs, adv_owner, adv_id) {
            adv.affected_resolution.push(Resolution {
                state: text(&row, 2)?,
                components: Vec::new(),
            });
            res_owner.insert(res_id, (adv_id, adv.affected_resolution.len() - 1));
        }
    }

    let mut res_ids: Vec<i64> = res_owner.keys().copied().collect();
    res_ids.sort_unstable();
    for res in res_ids.chunks(HOST_PARAM_CHUNK) {
        let comp_sql = "SELECT resolution_id, component FROM components WHERE resolution_id";
        for row in fetch_in(conn, dialect, comp_sql, res).await? {
            let Some(&(adv_id, pos)) = res_owner.get(&int(&row, 0)?) else {
                continue;
            };
            if let Some(r) = owner_of(defs, adv_owner, adv_id).and_then(|adv| adv.affected_resolution.get_mut(pos)) {
                r.components.push(Component { component: text(&row, 1)? });
            }
        }
    }
    Ok(())
}
