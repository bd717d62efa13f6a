//! Query execution and reference resolution
//!
//! A resolve pass runs one translated query and then makes sure every item
//! it produced has its dependent fields filled in:
//! 1. execute the SQL and build provisional items from the rows
//! 2. swap in instances the cache already knows, record every item in the
//!    shared context and note which parent, children and JSON references
//!    still need loading
//! 3. satisfy what the cache can, and run the rest as sub-passes (id-in
//!    queries for references, parent-column queries for children) that feed
//!    the same context
//! 4. patch the links of the newly loaded items from the context
//! 5. unify the items with the cache
//!
//! Items are recorded in the context before their own dependencies are
//! resolved, so a cycle (a contact and its identities) finds the partially
//! loaded peer instead of loading it again.

use rusqlite::params_from_iter;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::adapters::sqlite::{prepare, SqlExecutor};
use crate::cache::{Collection, CollectionListener, CollectionManager};
use crate::nouns::{AttributeBinder, AttributeDef, NounDef, NounRegistry, SpecialKind};
use crate::query::{translate, Constraint, Query, QueryKind, TranslatedQuery};
use crate::types::{AttributeValue, GlodaError, ItemRef, JsonAttributes, NounId, Resolution, Result};

type PassFuture = Pin<Box<dyn Future<Output = Result<Vec<ItemRef>>> + Send>>;

/// Items seen by every pass of one top-level query.
#[derive(Debug, Default)]
pub struct ResolveContext {
    references: HashMap<NounId, HashMap<i64, ItemRef>>,
    /// Child noun to parent id to the children seen so far.
    inverse: HashMap<NounId, HashMap<i64, Vec<ItemRef>>>,
}

impl ResolveContext {
    fn reference(&self, noun: NounId, id: i64) -> Option<ItemRef> {
        self.references.get(&noun)?.get(&id).cloned()
    }

    /// Returns the instance recorded for `(noun, id)`, recording the one
    /// `make` yields when there is none. The flag is set when `make` ran.
    fn get_or_insert_with(
        &mut self,
        noun: NounId,
        id: i64,
        make: impl FnOnce() -> ItemRef,
    ) -> (ItemRef, bool) {
        match self.references.entry(noun).or_default().entry(id) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => (entry.insert(make()).clone(), true),
        }
    }

    fn add_child(&mut self, parent_id: i64, child: &ItemRef) {
        let children = self
            .inverse
            .entry(child.noun_id())
            .or_default()
            .entry(parent_id)
            .or_default();
        if !children.iter().any(|c| c.id() == child.id()) {
            children.push(child.clone());
        }
    }

    fn children(&self, noun: NounId, parent_id: i64) -> Vec<ItemRef> {
        self.inverse
            .get(&noun)
            .and_then(|by_parent| by_parent.get(&parent_id))
            .cloned()
            .unwrap_or_default()
    }
}

/// A dependent field of a freshly loaded item.
enum Dependency {
    Parent {
        attribute: Arc<AttributeDef>,
        id: Option<i64>,
    },
    Children {
        attribute: Arc<AttributeDef>,
    },
    Reference {
        attribute: Arc<AttributeDef>,
        ids: Vec<i64>,
    },
    Value {
        name: String,
        value: AttributeValue,
    },
}

#[derive(Default)]
struct PendingLoads {
    references: HashMap<NounId, HashSet<i64>>,
    /// Child noun to the parent ids whose children must be loaded.
    inverse: HashMap<NounId, HashSet<i64>>,
}

fn lock(ctx: &Mutex<ResolveContext>) -> MutexGuard<'_, ResolveContext> {
    ctx.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct QueryResolver {
    executor: Arc<SqlExecutor>,
    registry: Arc<RwLock<NounRegistry>>,
    cache: Arc<CollectionManager>,
    binder: Arc<dyn AttributeBinder>,
}

impl QueryResolver {
    pub fn new(
        executor: Arc<SqlExecutor>,
        registry: Arc<RwLock<NounRegistry>>,
        cache: Arc<CollectionManager>,
        binder: Arc<dyn AttributeBinder>,
    ) -> Self {
        Self {
            executor,
            registry,
            cache,
            binder,
        }
    }

    fn registry(&self) -> Result<RwLockReadGuard<'_, NounRegistry>> {
        self.registry
            .read()
            .map_err(|_| GlodaError::Other("noun registry lock poisoned".into()))
    }

    /// Runs `query` and returns a live collection of fully resolved items.
    /// The listener hears `on_items_added` then `on_query_completed`.
    pub async fn query(
        &self,
        query: Query,
        listener: Option<Arc<dyn CollectionListener>>,
    ) -> Result<Arc<Collection>> {
        let items = if query.kind == QueryKind::Null {
            Vec::new()
        } else {
            self.load(query.clone()).await?
        };

        let collection = Arc::new(Collection::new(query, listener));
        let added = collection.add_items(&items);
        self.cache.register_collection(&collection);
        collection.notify_added(&added);
        collection.notify_completed();
        Ok(collection)
    }

    /// Runs `query` and returns its resolved items without a collection.
    pub async fn load(&self, query: Query) -> Result<Vec<ItemRef>> {
        let ctx = Arc::new(Mutex::new(ResolveContext::default()));
        self.clone().resolve_pass(query, ctx).await
    }

    fn resolve_pass(self, query: Query, ctx: Arc<Mutex<ResolveContext>>) -> PassFuture {
        Box::pin(async move {
            // 1. execute
            let (noun, translated, load_attributes, parent_column) = {
                let registry = self.registry()?;
                let noun = registry.noun(query.noun)?;
                let translated = translate(&query, &registry, self.binder.as_ref())?;
                (
                    noun,
                    translated,
                    registry.load_attributes(query.noun),
                    registry.parent_column_attr(query.noun),
                )
            };
            let rows = self.fetch(noun.clone(), translated).await?;

            // 2. pick the canonical instances and note what needs loading
            let mut seen = HashSet::new();
            let mut items = Vec::with_capacity(rows.len());
            let mut loads = PendingLoads::default();
            let mut dependencies: Vec<(ItemRef, Vec<Dependency>)> = Vec::new();
            for row_item in rows {
                let id = row_item.id();
                if !seen.insert(id) {
                    continue;
                }

                // a pass of this context already owns the row, or this pass
                // claims the cached instance (else the row) for it
                let (item, claimed) = {
                    let mut ctx = lock(&ctx);
                    let (item, claimed) = ctx.get_or_insert_with(noun.id(), id, || {
                        self.cache
                            .cache_lookup_one(noun.id(), id, false)
                            .unwrap_or_else(|| row_item.clone())
                    });
                    if let Some(parent) = &parent_column {
                        if let Some(parent_id) = parent_id(&item, parent) {
                            ctx.add_child(parent_id, &item);
                        }
                    }
                    (item, claimed)
                };

                let fresh = Arc::ptr_eq(&item, &row_item);
                if claimed && (fresh || !self.links_resolved(&item, &load_attributes)) {
                    let deps = self.collect_dependencies(&item, &load_attributes, &mut loads)?;
                    dependencies.push((item.clone(), deps));
                }
                items.push(item);
            }

            // 3. load what the context and cache cannot provide
            if !loads.references.is_empty() || !loads.inverse.is_empty() {
                let subqueries = self.plan_subqueries(&ctx, loads)?;
                if !subqueries.is_empty() {
                    debug!(
                        "Resolving {} {} items needs {} sub-queries",
                        items.len(),
                        noun.name(),
                        subqueries.len()
                    );
                    let mut set = JoinSet::new();
                    for subquery in subqueries {
                        set.spawn(self.clone().resolve_pass(subquery, ctx.clone()));
                    }
                    while let Some(joined) = set.join_next().await {
                        match joined {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => warn!("Sub-query of {} failed: {}", noun.name(), e),
                            Err(e) => warn!("Sub-query of {} aborted: {}", noun.name(), e),
                        }
                    }
                }
            }

            // 4. patch links
            {
                let ctx = lock(&ctx);
                for (item, deps) in &dependencies {
                    apply_dependencies(&ctx, item, deps);
                }
            }

            // 5. establish identity
            Ok(self.cache.cache_load_unify(noun.id(), items))
        })
    }

    async fn fetch(
        &self,
        noun: Arc<dyn NounDef>,
        translated: TranslatedQuery,
    ) -> Result<Vec<ItemRef>> {
        let explain = self.executor.explain();
        self.executor
            .execute_async(move |conn| {
                if let Some(explain) = &explain {
                    explain.record(conn, &translated.sql, &translated.args);
                }
                let mut statement = prepare(conn, &translated.sql)?;
                let rows = statement.query_map(params_from_iter(translated.args.iter()), |row| {
                    noun.row_to_object(row)
                })?;
                let mut items = Vec::new();
                for row in rows {
                    match row {
                        Ok(item) => items.push(item),
                        Err(e) => warn!("Skipping unreadable {} row: {}", noun.name(), e),
                    }
                }
                Ok(items)
            })
            .await
    }

    /// Notes the references of a freshly loaded item. Attribute ids no
    /// registered attribute owns are dropped from the item's JSON blob.
    fn collect_dependencies(
        &self,
        item: &ItemRef,
        load_attributes: &[Arc<AttributeDef>],
        loads: &mut PendingLoads,
    ) -> Result<Vec<Dependency>> {
        let mut deps = Vec::new();
        for attribute in load_attributes {
            match attribute.special() {
                Some(SpecialKind::Parent) => {
                    let id = parent_id(item, attribute);
                    if let Some(id) = id {
                        loads
                            .references
                            .entry(attribute.object_noun())
                            .or_default()
                            .insert(id);
                    }
                    deps.push(Dependency::Parent {
                        attribute: attribute.clone(),
                        id,
                    });
                }
                Some(SpecialKind::Children) => {
                    loads
                        .inverse
                        .entry(attribute.object_noun())
                        .or_default()
                        .insert(item.id());
                    deps.push(Dependency::Children {
                        attribute: attribute.clone(),
                    });
                }
                _ => {}
            }
        }

        let Some(json) = item.json_attributes() else {
            return Ok(deps);
        };
        let mut kept = JsonAttributes::new();
        let mut dropped = 0;
        for (attribute_id, value) in json.iter() {
            let Some((attribute, _parameter)) = self.binder.attribute_for_id(attribute_id) else {
                dropped += 1;
                continue;
            };
            kept.insert(attribute_id, value.clone());

            let references_items = {
                let registry = self.registry()?;
                registry
                    .noun(attribute.object_noun())
                    .map(|n| n.table().is_some())
                    .unwrap_or(false)
            };
            if references_items {
                let ids = value.referenced_ids();
                loads
                    .references
                    .entry(attribute.object_noun())
                    .or_default()
                    .extend(ids.iter().copied());
                deps.push(Dependency::Reference { attribute, ids });
            } else {
                deps.push(Dependency::Value {
                    name: attribute.bound_name().to_string(),
                    value: value.clone(),
                });
            }
        }
        if dropped > 0 {
            warn!(
                "Dropped {} unknown attributes while loading {} {}",
                dropped,
                item.noun_id(),
                item.id()
            );
            item.set_json_attributes(kept);
        }
        Ok(deps)
    }

    /// Whether every parent and children link the noun declares, and every
    /// attribute of its JSON blob, is already resolved on `item`. Items the
    /// cache got from inserts or synchronous lookups are not.
    fn links_resolved(&self, item: &ItemRef, load_attributes: &[Arc<AttributeDef>]) -> bool {
        let state = item.state();
        let declared = load_attributes
            .iter()
            .all(|attribute| state.link(attribute.bound_name()).is_resolved());
        declared
            && item.json_attributes().map_or(true, |json| {
                json.iter().all(|(attribute_id, _)| {
                    match self.binder.attribute_for_id(attribute_id) {
                        Some((attribute, _)) => {
                            let name = attribute.bound_name();
                            state.link(name).is_resolved() || state.attribute(name).is_some()
                        }
                        None => true,
                    }
                })
            })
    }

    /// Turns pending loads into sub-queries, resolving what the context or
    /// the cache already has.
    fn plan_subqueries(&self, ctx: &Mutex<ResolveContext>, loads: PendingLoads) -> Result<Vec<Query>> {
        let mut subqueries = Vec::new();

        for (noun, ids) in loads.references {
            let unknown: Vec<i64> = {
                let ctx = lock(ctx);
                ids.into_iter()
                    .filter(|id| ctx.reference(noun, *id).is_none())
                    .collect()
            };
            if unknown.is_empty() {
                continue;
            }

            let (found, mut missing) = self.cache.cache_lookup_many(noun, &unknown);
            let (parent_column, load_attributes) = {
                let registry = self.registry()?;
                (registry.parent_column_attr(noun), registry.load_attributes(noun))
            };
            {
                let mut ctx = lock(ctx);
                for (id, item) in found {
                    // cached but never resolved: the sub-pass resolves it
                    if !self.links_resolved(&item, &load_attributes) {
                        missing.push(id);
                        continue;
                    }
                    let (item, _) = ctx.get_or_insert_with(noun, id, || item);
                    if let Some(parent) = &parent_column {
                        if let Some(parent_id) = parent_id(&item, parent) {
                            ctx.add_child(parent_id, &item);
                        }
                    }
                }
            }
            if !missing.is_empty() {
                let mut sorted = missing;
                sorted.sort_unstable();
                subqueries.push(Query::id_in(noun, sorted));
            }
        }

        for (child_noun, parent_ids) in loads.inverse {
            let Some(parent) = self.registry()?.parent_column_attr(child_noun) else {
                warn!("Noun {} has children but no parent column", child_noun);
                continue;
            };
            let mut values: Vec<i64> = parent_ids.into_iter().collect();
            values.sort_unstable();
            subqueries.push(Query::new(child_noun).constrain(Constraint::In {
                attribute: parent,
                values: values.into_iter().map(AttributeValue::Int).collect(),
            }));
        }
        Ok(subqueries)
    }
}

fn parent_id(item: &ItemRef, parent: &AttributeDef) -> Option<i64> {
    item.column_value(parent.value_column())
        .and_then(|value| value.as_i64())
}

fn apply_dependencies(ctx: &ResolveContext, item: &ItemRef, deps: &[Dependency]) {
    let state = item.state();
    for dep in deps {
        match dep {
            Dependency::Parent { attribute, id } => {
                let resolution = id
                    .and_then(|id| ctx.reference(attribute.object_noun(), id))
                    .map(Resolution::One)
                    .unwrap_or(Resolution::Absent);
                state.set_link(attribute.bound_name(), resolution);
            }
            Dependency::Children { attribute } => {
                let children = ctx.children(attribute.object_noun(), item.id());
                state.set_children(attribute.bound_name(), &children);
            }
            Dependency::Reference { attribute, ids } => {
                let resolved: Vec<ItemRef> = ids
                    .iter()
                    .filter_map(|id| ctx.reference(attribute.object_noun(), *id))
                    .collect();
                let resolution = if attribute.singular() {
                    resolved
                        .into_iter()
                        .next()
                        .map(Resolution::One)
                        .unwrap_or(Resolution::Absent)
                } else {
                    Resolution::Many(resolved)
                };
                state.set_link(attribute.bound_name(), resolution);
            }
            Dependency::Value { name, value } => state.set_attribute(name, value.clone()),
        }
    }
}
