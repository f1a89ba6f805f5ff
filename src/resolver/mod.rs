//! Context resolvers: database-resolved session variables.
//!
//! Resolvers are named SQL lookups that run after upstream authentication to
//! derive additional session variables from database state. They execute in
//! dependency order, chain results through bind parameters, and cache rows
//! under a process-wide TTL cache.

use bytes::BytesMut;
use log::{debug, error, info};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use crate::client::context::SessionContext;
use crate::errors::Error;
use crate::messages::constants::*;
use crate::messages::{
    check_session_var, escape_set_value, parse_data_row, parse_row_description, simple_query,
    try_read_message, write_all_flush,
};
use crate::prometheus::{
    RESOLVER_CACHE_HITS_TOTAL, RESOLVER_CACHE_MISSES_TOTAL, RESOLVER_ERRORS_TOTAL,
    RESOLVER_EXECUTIONS_TOTAL,
};
use crate::server::connect::read_upstream;
use crate::server::stream::StreamInner;

/// Hard ceiling on resolver chain length.
const MAX_RESOLVERS: usize = 10;

/// Bounded cache: oldest entries are evicted first once full.
const MAX_CACHE_ENTRIES: usize = 10_240;

/// Top-level structure of the resolver TOML file.
#[derive(Debug, Deserialize)]
struct ResolverFile {
    resolver: Vec<ResolverToml>,
}

/// One `[[resolver]]` block.
#[derive(Debug, Deserialize)]
struct ResolverToml {
    name: String,
    query: String,
    #[serde(default)]
    params: Vec<String>,
    /// result column name → session variable name.
    inject: BTreeMap<String, String>,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    unique: bool,
    #[serde(default)]
    depends_on: Vec<String>,
    /// Seconds; 0 disables caching for this resolver.
    #[serde(default)]
    cache_ttl: u64,
}

/// Validated resolver definition.
#[derive(Debug, Clone)]
pub struct ResolverDef {
    pub name: String,
    pub query: String,
    pub params: Vec<String>,
    /// (result column, session variable), in deterministic order.
    pub inject: Vec<(String, String)>,
    pub required: bool,
    pub unique: bool,
    pub depends_on: Vec<String>,
    pub cache_ttl: Duration,
}

type CacheKey = (String, u64);

#[derive(Debug, Clone)]
struct CacheEntry {
    /// column name → value; `None` is a NULL column (or a no-row marker).
    values: HashMap<String, Option<String>>,
    expires_at: Instant,
}

#[derive(Default)]
struct ResolverCache {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Insertion order for oldest-first eviction. May contain stale keys;
    /// they are skipped when popped.
    order: VecDeque<CacheKey>,
}

impl ResolverCache {
    fn get(&self, key: &CacheKey, now: Instant) -> Option<CacheEntry> {
        self.entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .cloned()
    }

    fn insert(&mut self, key: CacheKey, entry: CacheEntry) {
        while self.entries.len() >= MAX_CACHE_ENTRIES {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        if self.entries.insert(key.clone(), entry).is_none() {
            self.order.push_back(key);
        }
    }

    fn evict_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }
}

/// A resolver failure, carrying the server's raw ErrorResponse when one was
/// received so the handler can forward it to the client verbatim.
#[derive(Debug)]
pub struct ResolverFailure {
    pub error: Error,
    pub server_error: Option<BytesMut>,
}

impl ResolverFailure {
    fn from_error(error: Error) -> Self {
        Self {
            error,
            server_error: None,
        }
    }
}

impl From<Error> for ResolverFailure {
    fn from(error: Error) -> Self {
        Self::from_error(error)
    }
}

/// Ordered resolvers plus the shared result cache.
pub struct ResolverEngine {
    resolvers: Vec<ResolverDef>,
    cache: Mutex<ResolverCache>,
}

/// Load resolvers from a TOML file, validate, and topologically sort.
pub fn load_resolvers(path: &str) -> Result<ResolverEngine, Error> {
    let content = std::fs::read_to_string(path)
        .map_err(|err| Error::BadConfig(format!("cannot read resolver file '{path}': {err}")))?;

    let parsed: ResolverFile = toml::from_str(&content)
        .map_err(|err| Error::BadConfig(format!("invalid TOML in '{path}': {err}")))?;

    if parsed.resolver.is_empty() {
        return Err(Error::BadConfig(format!(
            "resolver file '{path}' contains no [[resolver]] blocks"
        )));
    }
    if parsed.resolver.len() > MAX_RESOLVERS {
        return Err(Error::BadConfig(format!(
            "too many resolvers (max {MAX_RESOLVERS})"
        )));
    }

    let defs: Vec<ResolverDef> = parsed
        .resolver
        .into_iter()
        .map(|r| ResolverDef {
            name: r.name,
            query: r.query,
            params: r.params,
            inject: r.inject.into_iter().collect(),
            required: r.required,
            unique: r.unique,
            depends_on: r.depends_on,
            cache_ttl: Duration::from_secs(r.cache_ttl),
        })
        .collect();

    validate(&defs)?;
    let sorted = topological_sort(&defs)?;

    info!(
        "Loaded {} resolver(s): {}",
        sorted.len(),
        sorted
            .iter()
            .map(|d| d.name.as_str())
            .collect::<Vec<_>>()
            .join(" → ")
    );

    Ok(ResolverEngine {
        resolvers: sorted,
        cache: Mutex::new(ResolverCache::default()),
    })
}

fn validate(defs: &[ResolverDef]) -> Result<(), Error> {
    let mut names: HashSet<&str> = HashSet::new();
    for def in defs {
        if !names.insert(&def.name) {
            return Err(Error::BadConfig(format!(
                "duplicate resolver name: '{}'",
                def.name
            )));
        }
    }

    for def in defs {
        for dep in &def.depends_on {
            if !names.contains(dep.as_str()) {
                return Err(Error::BadConfig(format!(
                    "resolver '{}' depends on '{}' which does not exist",
                    def.name, dep
                )));
            }
        }
        for param in &def.params {
            check_session_var(param)?;
        }
        for (_, session_var) in &def.inject {
            check_session_var(session_var)?;
        }
        if def.inject.is_empty() {
            return Err(Error::BadConfig(format!(
                "resolver '{}' injects nothing",
                def.name
            )));
        }
        // Every declared parameter must be referenced.
        for i in 1..=def.params.len() {
            if !def.query.contains(&format!("${i}")) {
                return Err(Error::BadConfig(format!(
                    "resolver '{}' declares {} param(s) but does not reference ${i}",
                    def.name,
                    def.params.len()
                )));
            }
        }
    }

    Ok(())
}

/// Kahn's algorithm over the `depends_on` edges.
fn topological_sort(defs: &[ResolverDef]) -> Result<Vec<ResolverDef>, Error> {
    let name_to_idx: HashMap<&str, usize> = defs
        .iter()
        .enumerate()
        .map(|(i, d)| (d.name.as_str(), i))
        .collect();

    let n = defs.len();
    let mut in_degree = vec![0usize; n];
    let mut adjacent: Vec<Vec<usize>> = vec![vec![]; n];

    for (i, def) in defs.iter().enumerate() {
        for dep in &def.depends_on {
            adjacent[name_to_idx[dep.as_str()]].push(i);
            in_degree[i] += 1;
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &next in &adjacent[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if order.len() != n {
        return Err(Error::BadConfig(
            "cycle detected in resolver dependencies".to_string(),
        ));
    }

    Ok(order.into_iter().map(|i| defs[i].clone()).collect())
}

impl ResolverEngine {
    pub fn resolver_names(&self) -> Vec<String> {
        self.resolvers.iter().map(|d| d.name.clone()).collect()
    }

    pub fn cache_size(&self) -> usize {
        self.cache.lock().entries.len()
    }

    /// Drop expired cache entries; called periodically from a background task.
    pub fn evict_expired(&self) {
        let evicted = self.cache.lock().evict_expired(Instant::now());
        if evicted > 0 {
            debug!("Resolver cache: evicted {evicted} expired entries");
        }
    }

    /// Run every resolver in topological order, extending `context` with the
    /// injected variables. `context` arrives seeded from the parsed identity.
    pub async fn resolve_context(
        &self,
        server: &mut StreamInner,
        server_buf: &mut BytesMut,
        context: &mut SessionContext,
        conn_id: u64,
    ) -> Result<(), ResolverFailure> {
        for def in &self.resolvers {
            // Bind parameters from the current context.
            let mut input_values = Vec::with_capacity(def.params.len());
            let mut skip = false;
            for param in &def.params {
                match context.get(param) {
                    Some(Some(value)) => input_values.push(Some(value.clone())),
                    Some(None) => {
                        input_values.push(None);
                        skip = true;
                    }
                    None => {
                        error!(
                            "[conn: {conn_id}] resolver '{}' references unknown context variable '{param}'",
                            def.name
                        );
                        return Err(ResolverFailure::from_error(Error::ResolverError {
                            name: def.name.clone(),
                            message: format!("references unknown context variable '{param}'"),
                        }));
                    }
                }
            }

            // A NULL input means an upstream optional resolver matched
            // nothing; this resolver cannot run either.
            if skip {
                debug!("[conn: {conn_id}] resolver '{}' skipped, NULL input", def.name);
                for (_, session_var) in &def.inject {
                    context.set(session_var, None);
                }
                continue;
            }

            // Cache lookup.
            let cache_key = if def.cache_ttl > Duration::ZERO {
                let key = make_cache_key(&def.name, &input_values);
                if let Some(entry) = self.cache.lock().get(&key, Instant::now()) {
                    RESOLVER_CACHE_HITS_TOTAL.inc();
                    debug!("[conn: {conn_id}] resolver '{}' cache hit", def.name);
                    for (column, session_var) in &def.inject {
                        context.set(session_var, entry.values.get(column).cloned().flatten());
                    }
                    continue;
                }
                Some(key)
            } else {
                None
            };

            RESOLVER_CACHE_MISSES_TOTAL.inc();
            RESOLVER_EXECUTIONS_TOTAL
                .with_label_values(&[def.name.as_str()])
                .inc();

            let row = match execute_resolver(server, server_buf, def, &input_values, conn_id).await
            {
                Ok(row) => row,
                Err(failure) => {
                    RESOLVER_ERRORS_TOTAL.with_label_values(&[def.name.as_str()]).inc();
                    return Err(failure);
                }
            };

            let values: HashMap<String, Option<String>> = match row {
                Some(row) => row.into_iter().collect(),
                None if def.required => {
                    error!(
                        "[conn: {conn_id}] required resolver '{}' returned no rows",
                        def.name
                    );
                    RESOLVER_ERRORS_TOTAL.with_label_values(&[def.name.as_str()]).inc();
                    return Err(ResolverFailure::from_error(Error::ResolverNoRows(
                        def.name.clone(),
                    )));
                }
                None => {
                    debug!(
                        "[conn: {conn_id}] resolver '{}' matched no rows, outputs are NULL",
                        def.name
                    );
                    HashMap::new()
                }
            };

            for (column, session_var) in &def.inject {
                context.set(session_var, values.get(column).cloned().flatten());
            }

            if let Some(key) = cache_key {
                self.cache.lock().insert(
                    key,
                    CacheEntry {
                        values,
                        expires_at: Instant::now() + def.cache_ttl,
                    },
                );
            }
        }

        Ok(())
    }
}

/// Execute one resolver query. `Ok(Some(row))` for the first row, `Ok(None)`
/// for zero rows.
async fn execute_resolver(
    server: &mut StreamInner,
    server_buf: &mut BytesMut,
    def: &ResolverDef,
    input_values: &[Option<String>],
    conn_id: u64,
) -> Result<Option<Vec<(String, Option<String>)>>, ResolverFailure> {
    let sql = substitute_params(&def.query, input_values);
    debug!("[conn: {conn_id}] resolver '{}': {sql}", def.name);

    let query = simple_query(&sql);
    write_all_flush(server, &query).await?;

    let mut columns: Vec<String> = Vec::new();
    let mut first_row: Option<Vec<(String, Option<String>)>> = None;
    let mut row_count = 0usize;

    loop {
        if server_buf.is_empty() {
            read_upstream(server, server_buf).await?;
        }

        while let Some(message) = try_read_message(server_buf)? {
            match message.tag {
                MESSAGE_ROW_DESCRIPTION => {
                    columns = parse_row_description(&message.payload);
                }
                MESSAGE_DATA_ROW => {
                    row_count += 1;
                    if first_row.is_none() {
                        first_row = Some(parse_data_row(&message.payload, &columns));
                    }
                }
                MESSAGE_COMMAND_COMPLETE | MESSAGE_EMPTY_QUERY_RESPONSE => {}
                MESSAGE_READY_FOR_QUERY => {
                    if def.unique && row_count > 1 {
                        error!(
                            "[conn: {conn_id}] resolver '{}' expected a unique row, got {row_count}",
                            def.name
                        );
                        return Err(ResolverFailure::from_error(Error::ResolverError {
                            name: def.name.clone(),
                            message: format!("expected at most one row, got {row_count}"),
                        }));
                    }
                    return Ok(first_row);
                }
                MESSAGE_ERROR_RESPONSE => {
                    let text = message.error_message();
                    error!("[conn: {conn_id}] resolver '{}' query error: {text}", def.name);
                    let raw = message.raw.clone();
                    drain_to_ready(server, server_buf).await?;
                    return Err(ResolverFailure {
                        error: Error::ResolverError {
                            name: def.name.clone(),
                            message: text,
                        },
                        server_error: Some(raw),
                    });
                }
                // NoticeResponse and friends.
                _ => {}
            }
        }
    }
}

/// Consume server frames until ReadyForQuery; used after an ErrorResponse so
/// the connection can be torn down in a known state.
async fn drain_to_ready(server: &mut StreamInner, server_buf: &mut BytesMut) -> Result<(), Error> {
    loop {
        if server_buf.is_empty() {
            read_upstream(server, server_buf).await?;
        }
        while let Some(message) = try_read_message(server_buf)? {
            if message.is_ready_for_query() {
                return Ok(());
            }
        }
    }
}

/// Replace `$1`, `$2`, … with escaped literals, in reverse order so `$10`
/// is not clobbered by `$1`.
fn substitute_params(sql: &str, values: &[Option<String>]) -> String {
    let mut result = sql.to_string();
    for i in (0..values.len()).rev() {
        let placeholder = format!("${}", i + 1);
        let replacement = match &values[i] {
            Some(value) => escape_set_value(value),
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &replacement);
    }
    result
}

fn make_cache_key(name: &str, input_values: &[Option<String>]) -> CacheKey {
    let mut hasher = DefaultHasher::new();
    for value in input_values {
        value.hash(&mut hasher);
    }
    (name.to_string(), hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_def(name: &str, deps: &[&str]) -> ResolverDef {
        ResolverDef {
            name: name.to_string(),
            query: String::new(),
            params: vec![],
            inject: vec![("c".into(), "app.v".into())],
            required: false,
            unique: false,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            cache_ttl: Duration::ZERO,
        }
    }

    #[test]
    fn topological_sort_orders_chain() {
        let defs = vec![
            make_def("c", &["b"]),
            make_def("a", &[]),
            make_def("b", &["a"]),
        ];
        let sorted = topological_sort(&defs).unwrap();
        let names: Vec<&str> = sorted.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn topological_sort_detects_cycle() {
        let defs = vec![make_def("a", &["b"]), make_def("b", &["a"])];
        assert!(topological_sort(&defs).is_err());
    }

    #[test]
    fn topological_sort_without_deps_keeps_everything() {
        let defs = vec![make_def("x", &[]), make_def("y", &[])];
        assert_eq!(topological_sort(&defs).unwrap().len(), 2);
    }

    #[test]
    fn validate_rejects_duplicates_and_unknown_deps() {
        let defs = vec![make_def("a", &[]), make_def("a", &[])];
        assert!(validate(&defs).is_err());

        let defs = vec![make_def("a", &["ghost"])];
        assert!(validate(&defs).is_err());
    }

    #[test]
    fn validate_rejects_unreferenced_params() {
        let mut def = make_def("a", &[]);
        def.params = vec!["app.current_tenant_id".into()];
        def.query = "SELECT 1".into(); // no $1
        assert!(validate(&[def]).is_err());
    }

    #[test]
    fn validate_rejects_bad_session_var_in_inject() {
        let mut def = make_def("a", &[]);
        def.inject = vec![("c".into(), "bad;var".into())];
        assert!(validate(&[def]).is_err());
    }

    #[test]
    fn substitute_params_basic() {
        let sql = "SELECT * FROM t WHERE a = $1 AND b = $2";
        let values = vec![Some("hello".to_string()), Some("world".to_string())];
        assert_eq!(
            substitute_params(sql, &values),
            "SELECT * FROM t WHERE a = 'hello' AND b = 'world'"
        );
    }

    #[test]
    fn substitute_params_escapes_quotes() {
        let values = vec![Some("it's".to_string())];
        assert_eq!(
            substitute_params("SELECT $1", &values),
            "SELECT 'it''s'"
        );
    }

    #[test]
    fn substitute_params_array_literal() {
        let values = vec![Some("{abc,def}".to_string())];
        assert_eq!(
            substitute_params("SELECT * FROM t WHERE a = ANY($1::uuid[])", &values),
            "SELECT * FROM t WHERE a = ANY('{abc,def}'::uuid[])"
        );
    }

    #[test]
    fn substitute_params_null_and_ten_plus() {
        let mut values: Vec<Option<String>> = (1..=10).map(|i| Some(i.to_string())).collect();
        values[9] = None;
        let result = substitute_params("a=$1 j=$10", &values);
        assert_eq!(result, "a='1' j=NULL");
    }

    #[test]
    fn cache_key_is_stable_and_value_sensitive() {
        let a = make_cache_key("r", &[Some("x".into()), None]);
        let b = make_cache_key("r", &[Some("x".into()), None]);
        let c = make_cache_key("r", &[Some("y".into()), None]);
        assert_eq!(a, b);
        assert_ne!(a.1, c.1);
    }

    #[test]
    fn cache_respects_ttl_and_bound() {
        let mut cache = ResolverCache::default();
        let now = Instant::now();

        let key = make_cache_key("r", &[Some("x".into())]);
        cache.insert(
            key.clone(),
            CacheEntry {
                values: HashMap::new(),
                expires_at: now + Duration::from_secs(60),
            },
        );
        assert!(cache.get(&key, now).is_some());
        assert!(cache.get(&key, now + Duration::from_secs(61)).is_none());

        assert_eq!(cache.evict_expired(now + Duration::from_secs(61)), 1);
        assert!(cache.entries.is_empty());
    }

    #[test]
    fn cache_evicts_oldest_first_when_full() {
        let mut cache = ResolverCache::default();
        let far = Instant::now() + Duration::from_secs(3600);
        for i in 0..MAX_CACHE_ENTRIES + 5 {
            cache.insert(
                (format!("r{i}"), 0),
                CacheEntry {
                    values: HashMap::new(),
                    expires_at: far,
                },
            );
        }
        assert!(cache.entries.len() <= MAX_CACHE_ENTRIES);
        // The very first insert was evicted; the newest survives.
        assert!(cache.entries.get(&("r0".to_string(), 0)).is_none());
        assert!(cache
            .entries
            .get(&(format!("r{}", MAX_CACHE_ENTRIES + 4), 0))
            .is_some());
    }

    #[test]
    fn load_resolvers_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolvers.toml");
        std::fs::write(
            &path,
            r#"
[[resolver]]
name = "user_account"
query = "SELECT org_id, account_role FROM accounts WHERE id = $1::uuid"
params = ["app.current_tenant_id"]
required = true
cache_ttl = 30

[resolver.inject]
org_id = "app.org_id"
account_role = "app.account_role"

[[resolver]]
name = "org_features"
query = "SELECT features FROM orgs WHERE id = $1::uuid"
params = ["app.org_id"]
depends_on = ["user_account"]

[resolver.inject]
features = "app.features"
"#,
        )
        .unwrap();

        let engine = load_resolvers(path.to_str().unwrap()).unwrap();
        assert_eq!(
            engine.resolver_names(),
            vec!["user_account", "org_features"]
        );
        let first = &engine.resolvers[0];
        assert!(first.required);
        assert_eq!(first.cache_ttl, Duration::from_secs(30));
        assert_eq!(first.inject.len(), 2);
    }

    #[test]
    fn load_resolvers_rejects_cycles_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();

        let empty = dir.path().join("empty.toml");
        std::fs::write(&empty, "# nothing\n").unwrap();
        assert!(load_resolvers(empty.to_str().unwrap()).is_err());

        let cyclic = dir.path().join("cyclic.toml");
        std::fs::write(
            &cyclic,
            r#"
[[resolver]]
name = "a"
query = "SELECT 1"
depends_on = ["b"]
[resolver.inject]
c = "app.a"

[[resolver]]
name = "b"
query = "SELECT 1"
depends_on = ["a"]
[resolver.inject]
c = "app.b"
"#,
        )
        .unwrap();
        assert!(load_resolvers(cyclic.to_str().unwrap()).is_err());
    }
}
