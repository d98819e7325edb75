//! DependencyGraph (spec §4.4, component C4)
//!
//! Per-base directed graph of field -> field dependencies, derived from
//! formula expression parsing plus the implicit edges rollup/lookup/count
//! fields carry via their `link_field_id`. Grounded on
//! `services/relationship_cache.rs`'s `InboundRelationshipCache`: a
//! `RwLock<HashMap<...>>` cache guarded by an `AtomicBool` dirty flag and a
//! TTL, invalidated on schema writes rather than recomputed on every read.

use crate::models::Field;
use crate::services::error::EngineError;
use crate::services::field_registry::FieldRegistry;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Matches `{fieldName}` or `{fld_xxx}` references inside a formula
/// expression (spec §4.4 "formula references are braced identifiers").
fn reference_pattern() -> Regex {
    Regex::new(r"\{([^{}]+)\}").expect("static pattern")
}

struct CachedGraph {
    edges: HashMap<String, HashSet<String>>,
    built_at: Instant,
}

/// Directed edges point from a field to the fields it depends on ("field ->
/// dependency"); `dependents` walks them in reverse.
pub struct DependencyGraph {
    fields: Arc<FieldRegistry>,
    ttl: Duration,
    cache: RwLock<HashMap<String, CachedGraph>>,
    dirty: AtomicBool,
}

impl DependencyGraph {
    pub fn new(fields: Arc<FieldRegistry>, ttl: Duration) -> Self {
        Self { fields, ttl, cache: RwLock::new(HashMap::new()), dirty: AtomicBool::new(false) }
    }

    /// Marks every cached graph stale (spec §4.4: any field create/update/
    /// delete invalidates the whole base, not just the touched table, since
    /// formulas can reference fields across tables via lookups).
    pub fn invalidate(&self, table_id: &str) {
        self.dirty.store(true, Ordering::SeqCst);
        // Best-effort synchronous drop; a concurrent reader may still see
        // the stale entry until its TTL expires, which is an accepted
        // staleness window (spec §4.4 invariant iii).
        if let Ok(mut cache) = self.cache.try_write() {
            cache.remove(table_id);
        }
    }

    /// Exposed for `FieldRegistry::create_checked`/`update_checked`, which
    /// need a prospective field's dependency set before it has been
    /// persisted (and so can't be looked up by id via `build`).
    pub(crate) fn dependency_ids(options: &crate::models::FieldOptions, by_name: &HashMap<String, &Field>) -> HashSet<String> {
        let mut deps = HashSet::new();
        match options {
            crate::models::FieldOptions::Formula { expression, .. } => {
                for cap in reference_pattern().captures_iter(expression) {
                    let reference = &cap[1];
                    if let Some(f) = by_name.get(reference) {
                        deps.insert(f.id.clone());
                    } else {
                        deps.insert(reference.to_string());
                    }
                }
            }
            other => {
                if let Some(link_field_id) = other.dependent_link_field_id() {
                    deps.insert(link_field_id.to_string());
                }
            }
        }
        deps
    }

    fn edges_for_field(field: &Field, by_name: &HashMap<String, &Field>) -> HashSet<String> {
        Self::dependency_ids(&field.options, by_name)
    }

    /// Builds (or returns the cached) dependency graph for every computed
    /// field in `table_id`'s table.
    #[tracing::instrument(skip(self))]
    pub async fn build(&self, table_id: &str) -> Result<HashMap<String, HashSet<String>>, EngineError> {
        if !self.dirty.load(Ordering::SeqCst) {
            if let Some(cached) = self.cache.read().await.get(table_id) {
                if cached.built_at.elapsed() < self.ttl {
                    return Ok(cached.edges.clone());
                }
            }
        }

        let all_fields = self.fields.list(table_id).await?;
        let by_name: HashMap<String, &Field> = all_fields.iter().map(|f| (f.name.clone(), f)).collect();

        let mut edges = HashMap::new();
        for field in &all_fields {
            if field.is_computed() {
                edges.insert(field.id.clone(), Self::edges_for_field(field, &by_name));
            }
        }

        self.cache
            .write()
            .await
            .insert(table_id.to_string(), CachedGraph { edges: edges.clone(), built_at: Instant::now() });
        self.dirty.store(false, Ordering::SeqCst);

        Ok(edges)
    }

    /// Reverse-BFS: every field that transitively depends on `field_id`
    /// (spec §4.4 "recalculation starts from the changed field and fans
    /// out to its dependents").
    #[tracing::instrument(skip(self))]
    pub async fn dependents(&self, table_id: &str, field_id: &str) -> Result<Vec<String>, EngineError> {
        let edges = self.build(table_id).await?;
        let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
        for (field, deps) in &edges {
            for dep in deps {
                reverse.entry(dep.as_str()).or_default().push(field.as_str());
            }
        }

        let mut visited = HashSet::new();
        let mut queue = vec![field_id.to_string()];
        let mut order = Vec::new();
        while let Some(current) = queue.pop() {
            if let Some(children) = reverse.get(current.as_str()) {
                for child in children {
                    if visited.insert(child.to_string()) {
                        order.push(child.to_string());
                        queue.push(child.to_string());
                    }
                }
            }
        }
        Ok(order)
    }

    /// DFS cycle detection over a candidate edge set, returning the cycle
    /// path in dependency order for `EngineError::CircularDependency` (spec
    /// §4.4 invariant ii: formulas must not reference themselves,
    /// transitively or otherwise).
    pub fn detect_cycle(edges: &HashMap<String, HashSet<String>>) -> Option<Vec<String>> {
        #[derive(PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: HashMap<String, Mark> = HashMap::new();
        let mut stack = Vec::new();

        fn visit(
            node: &str,
            edges: &HashMap<String, HashSet<String>>,
            marks: &mut HashMap<String, Mark>,
            stack: &mut Vec<String>,
        ) -> Option<Vec<String>> {
            if let Some(Mark::Visiting) = marks.get(node) {
                let start = stack.iter().position(|n| n == node).unwrap_or(0);
                let mut cycle = stack[start..].to_vec();
                cycle.push(node.to_string());
                return Some(cycle);
            }
            if marks.get(node) == Some(&Mark::Done) {
                return None;
            }
            marks.insert(node.to_string(), Mark::Visiting);
            stack.push(node.to_string());
            if let Some(deps) = edges.get(node) {
                for dep in deps {
                    if let Some(cycle) = visit(dep, edges, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
            stack.pop();
            marks.insert(node.to_string(), Mark::Done);
            None
        }

        for node in edges.keys() {
            if let Some(cycle) = visit(node, edges, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }

    /// Validates that adding `new_deps` for `field_id` would not introduce a
    /// cycle, returning `CircularDependency` if it would.
    pub async fn check_acyclic(
        &self,
        table_id: &str,
        field_id: &str,
        new_deps: &HashSet<String>,
    ) -> Result<(), EngineError> {
        let mut edges = self.build(table_id).await?;
        edges.insert(field_id.to_string(), new_deps.clone());
        if let Some(cycle) = Self::detect_cycle(&edges) {
            return Err(EngineError::CircularDependency { cycle });
        }
        Ok(())
    }
}

/// Topologically orders `field_ids` so dependencies recalculate before
/// their dependents consume them (spec §4.4 "recalculation order").
pub fn topological_order(edges: &HashMap<String, HashSet<String>>, field_ids: &[String]) -> Vec<String> {
    let relevant: HashSet<&String> = field_ids.iter().collect();
    let mut visited = HashSet::new();
    let mut order = Vec::new();

    fn visit(
        node: &str,
        edges: &HashMap<String, HashSet<String>>,
        relevant: &HashSet<&String>,
        visited: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) {
        if !visited.insert(node.to_string()) {
            return;
        }
        if let Some(deps) = edges.get(node) {
            for dep in deps {
                if relevant.contains(dep) {
                    visit(dep, edges, relevant, visited, order);
                }
            }
        }
        order.push(node.to_string());
    }

    for id in field_ids {
        visit(id, edges, &relevant, &mut visited, &mut order);
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet as HSet;

    fn edges(pairs: &[(&str, &[&str])]) -> HashMap<String, HSet<String>> {
        pairs
            .iter()
            .map(|(k, deps)| (k.to_string(), deps.iter().map(|d| d.to_string()).collect()))
            .collect()
    }

    #[test]
    fn detects_a_direct_cycle() {
        let e = edges(&[("a", &["b"]), ("b", &["a"])]);
        let cycle = DependencyGraph::detect_cycle(&e);
        assert!(cycle.is_some());
    }

    #[test]
    fn acyclic_graph_has_no_cycle() {
        let e = edges(&[("a", &["b"]), ("b", &["c"]), ("c", &[])]);
        assert!(DependencyGraph::detect_cycle(&e).is_none());
    }

    #[test]
    fn topological_order_resolves_dependencies_before_dependents() {
        let e = edges(&[("a", &["b"]), ("b", &["c"]), ("c", &[])]);
        let order = topological_order(&e, &["a".to_string(), "b".to_string(), "c".to_string()]);
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn reference_pattern_extracts_braced_identifiers() {
        let re = reference_pattern();
        let caps: Vec<_> = re.captures_iter("{price} * {quantity}").map(|c| c[1].to_string()).collect();
        assert_eq!(caps, vec!["price", "quantity"]);
    }

    use crate::config::EngineConfig;
    use crate::db::{Connection, SqliteDialect};
    use crate::models::{FieldOptions, FieldType, Table};
    use crate::schema::SchemaProvider;
    use crate::services::field_registry::FieldCreateRequest;
    use crate::services::ot_channel::OtChannel;

    fn plain_request(name: &str) -> FieldCreateRequest {
        FieldCreateRequest {
            name: name.to_string(),
            description: None,
            field_type: FieldType::Number,
            options: FieldOptions::Number {
                precision: 0,
                min_value: None,
                max_value: None,
                format: None,
                show_commas: false,
                currency: None,
                default_value: None,
            },
            required: false,
            unique: false,
            is_primary: false,
        }
    }

    fn formula_request(name: &str, expression: &str) -> FieldCreateRequest {
        FieldCreateRequest {
            name: name.to_string(),
            description: None,
            field_type: FieldType::Formula,
            options: FieldOptions::Formula { expression: expression.to_string(), time_zone: None, formatting: None, show_as: None },
            required: false,
            unique: false,
            is_primary: false,
        }
    }

    /// Spec §8 scenario 4, end to end: a formula field that would close a
    /// dependency cycle is rejected at creation, through the same
    /// `create_checked`/`update_checked` path a real embedder would use,
    /// not just the bare `detect_cycle` algorithm.
    #[tokio::test]
    async fn formula_cycle_is_rejected_through_field_creation() {
        let conn = Connection::open(&EngineConfig::in_memory()).await.unwrap();
        let schema = Arc::new(SchemaProvider::new(conn.clone(), Arc::new(SqliteDialect)));
        let ot = Arc::new(OtChannel::new());
        let tables = Arc::new(crate::services::table_registry::TableRegistry::new(conn.clone()));
        tables.ensure_meta_table().await.unwrap();
        let fields = Arc::new(FieldRegistry::new(conn, schema.clone(), ot, tables));
        fields.ensure_meta_table().await.unwrap();
        let dependencies = DependencyGraph::new(fields.clone(), Duration::from_secs(60));

        let table = Table::new("base_1", "Orders");
        schema.create_physical_table(&table).await.unwrap();

        let _price = fields.create_checked(&table, plain_request("Price"), "u1", &dependencies).await.unwrap();
        // "Subtotal" starts out referencing nothing real yet, so no cycle.
        let subtotal = fields
            .create_checked(&table, formula_request("Subtotal", "{Price}"), "u1", &dependencies)
            .await
            .unwrap();
        let total = fields
            .create_checked(&table, formula_request("Total", "{Subtotal} * 2"), "u1", &dependencies)
            .await
            .unwrap();

        // Redefining Subtotal to depend on Total closes the cycle Subtotal -> Total -> Subtotal.
        let err = fields
            .update_checked(
                &subtotal.id,
                crate::services::field_registry::FieldPatch {
                    options: Some(FieldOptions::Formula {
                        expression: "{Total} + 1".to_string(),
                        time_zone: None,
                        formatting: None,
                        show_as: None,
                    }),
                    ..Default::default()
                },
                &dependencies,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CircularDependency { .. }));

        // The original, acyclic field is untouched.
        let reloaded = fields.get(&subtotal.id).await.unwrap();
        match &reloaded.options {
            FieldOptions::Formula { expression, .. } => assert_eq!(expression, "{Price}"),
            _ => panic!("expected formula options"),
        }
        let _ = total;
    }
}
