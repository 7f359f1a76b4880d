//! The incremental compiler.
//!
//! Source events mark the nodes of edited, moved and deleted sources for
//! unload. A compile then works one scope (usually one repository) at a
//! time, in dependency order, each inside its own transaction:
//!
//! 1. the stale nodes are detached, and those of removed sources deleted
//! 2. the scope's sources are parsed
//! 3. old nodes that were not reproduced, and every element depending on
//!    them, are unbound
//! 4. new and invalidated nodes are registered, bound to a fixed point,
//!    post-processed and validated
//! 5. the transaction commits, or rolls back and the error is returned
//!
//! Dependents found in a later scope are carried over to that scope
//! through the `to_unbind` and `to_process` sets.

use std::sync::{Arc, Weak};
use std::time::Instant;

use indexmap::{IndexMap, IndexSet};
use parking_lot::{Mutex, RwLock};
use rayon::ThreadPool;
use rustc_hash::{FxHashMap, FxHashSet};
use smol_str::SmolStr;

use super::diagnostics::{Diagnostic, Severity, codes};
use super::repository::{RepositorySet, Scope};
use super::unload::{unbind, walk_for_unload};
use super::{InvalidationPolicy, ValidationMode};
use crate::base::{NodeId, SourceId};
use crate::config::CompilerOptions;
use crate::error::{CoreError, Result};
use crate::graph::{BackReferencePopulator, GraphStore, Transaction, walk};
use crate::parallel;
use crate::passes::{CompilerEventHandler, ParseContext, PassContext, Passes, SourceParser};
use crate::resolve::FixedPoint;
use crate::source::{Source, SourceEventHandler, SourceMutation, SourceRegistry};

/// What one successful compile did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompileReport {
    /// Scopes compiled, in order.
    pub scopes: Vec<String>,
    /// Sources parsed.
    pub sources: Vec<SourceId>,
    /// Top-level nodes produced by parsing.
    pub new_instances: Vec<NodeId>,
    /// Pre-existing top-level nodes processed again because something they
    /// depend on changed.
    pub processed: Vec<NodeId>,
    /// What post-processing asked to delete, over all scopes.
    pub mutation: SourceMutation,
}

// ============================================================================
// BOOKKEEPING
// ============================================================================

/// A source as it was before an edit.
#[derive(Clone, Debug)]
struct SourceState {
    source: SourceId,
    old_content: Arc<str>,
    instances: Vec<NodeId>,
}

#[derive(Clone, Debug, Default)]
struct Bookkeeping {
    to_unload: IndexSet<NodeId>,
    to_process: IndexSet<NodeId>,
    to_unbind: IndexSet<NodeId>,
    processed: IndexSet<NodeId>,
    sources_to_be_removed: IndexSet<SourceId>,
    old_source_states: Vec<SourceState>,
    /// Package each unloaded, not yet deleted, element was detached from.
    detached_from: FxHashMap<NodeId, NodeId>,
}

impl Bookkeeping {
    fn mark_for_unload(&mut self, source: &Source) {
        if source.is_compiled() {
            self.to_unload.extend(source.new_instances());
        }
    }

    /// Take over source events recorded while a compile was running.
    fn absorb(&mut self, events: Bookkeeping) {
        self.to_unload.extend(events.to_unload);
        self.sources_to_be_removed.extend(events.sources_to_be_removed);
        self.old_source_states.extend(events.old_source_states);
    }
}

// ============================================================================
// COMPILER
// ============================================================================

/// Keeps a [`GraphStore`] in sync with the sources of a [`SourceRegistry`].
///
/// Built through [`IncrementalCompiler::builder`]; the compiler subscribes
/// to the registry's source events when built.
pub struct IncrementalCompiler {
    store: GraphStore,
    registry: Arc<SourceRegistry>,
    parser: Arc<dyn SourceParser>,
    passes: Passes,
    populator: BackReferencePopulator,
    repositories: RepositorySet,
    pool: Option<Arc<ThreadPool>>,
    options: CompilerOptions,
    bookkeeping: Mutex<Bookkeeping>,
    handlers: RwLock<Vec<Arc<dyn CompilerEventHandler>>>,
    /// Serializes compiles.
    compiling: Mutex<()>,
}

impl std::fmt::Debug for IncrementalCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncrementalCompiler")
            .field("store", &self.store.id())
            .field("passes", &self.passes)
            .field("parallel", &self.pool.is_some())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

pub struct IncrementalCompilerBuilder {
    store: GraphStore,
    registry: Arc<SourceRegistry>,
    parser: Arc<dyn SourceParser>,
    passes: Passes,
    repositories: RepositorySet,
    pool: Option<Arc<ThreadPool>>,
    options: CompilerOptions,
}

impl IncrementalCompilerBuilder {
    pub fn with_passes(mut self, passes: Passes) -> Self {
        self.passes = passes;
        self
    }

    pub fn with_repositories(mut self, repositories: RepositorySet) -> Self {
        self.repositories = repositories;
        self
    }

    pub fn with_pool(mut self, pool: Arc<ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_options(mut self, options: CompilerOptions) -> Self {
        self.options = options;
        self
    }

    /// Create the compiler and subscribe it to the registry's source events.
    pub fn build(self) -> Arc<IncrementalCompiler> {
        let compiler = Arc::new(IncrementalCompiler {
            populator: BackReferencePopulator::new(self.store.clone()),
            store: self.store,
            registry: self.registry,
            parser: self.parser,
            passes: self.passes,
            repositories: self.repositories,
            pool: self.pool,
            options: self.options,
            bookkeeping: Mutex::new(Bookkeeping::default()),
            handlers: RwLock::new(Vec::new()),
            compiling: Mutex::new(()),
        });
        let weak = Arc::downgrade(&compiler);
        let handler: Weak<dyn SourceEventHandler> = weak;
        compiler.registry.add_event_handler(handler);
        compiler
    }
}

impl IncrementalCompiler {
    pub fn builder(
        store: GraphStore,
        registry: Arc<SourceRegistry>,
        parser: Arc<dyn SourceParser>,
    ) -> IncrementalCompilerBuilder {
        IncrementalCompilerBuilder {
            store,
            registry,
            parser,
            passes: Passes::default(),
            repositories: RepositorySet::default(),
            pool: None,
            options: CompilerOptions::default(),
        }
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    pub fn repositories(&self) -> &RepositorySet {
        &self.repositories
    }

    pub fn add_compiler_event_handler(&self, handler: Arc<dyn CompilerEventHandler>) {
        self.handlers.write().push(handler);
    }

    pub fn remove_compiler_event_handler(&self, handler: &Arc<dyn CompilerEventHandler>) {
        self.handlers.write().retain(|h| !Arc::ptr_eq(h, handler));
    }

    /// Top-level nodes waiting to be unloaded.
    pub fn to_unload(&self) -> Vec<NodeId> {
        self.bookkeeping.lock().to_unload.iter().copied().collect()
    }

    /// Top-level nodes waiting to be processed again.
    pub fn to_process(&self) -> Vec<NodeId> {
        self.bookkeeping.lock().to_process.iter().copied().collect()
    }

    /// Top-level nodes waiting to be unbound and processed again.
    pub fn to_unbind(&self) -> Vec<NodeId> {
        self.bookkeeping.lock().to_unbind.iter().copied().collect()
    }

    pub fn sources_to_be_removed(&self) -> Vec<SourceId> {
        self.bookkeeping.lock().sources_to_be_removed.iter().cloned().collect()
    }

    /// Forget all pending work.
    pub fn reset(&self) {
        *self.bookkeeping.lock() = Bookkeeping::default();
        tracing::debug!("reset incremental compiler");
    }

    fn pool(&self) -> Option<&ThreadPool> {
        self.pool.as_deref()
    }

    fn source_of(&self, node: NodeId) -> Option<SourceId> {
        self.store.span(node).map(|s| s.source)
    }

    fn repository_of(&self, node: NodeId) -> Option<SmolStr> {
        self.source_of(node)?.repository().map(SmolStr::new)
    }

    fn in_scope(&self, scope: &Scope, node: NodeId) -> bool {
        scope.contains(self.repository_of(node).as_deref())
    }

    /// `nodes` without those that have no source or whose source is being removed.
    fn without_removed_sources(&self, book: &Bookkeeping, nodes: impl IntoIterator<Item = NodeId>) -> IndexSet<NodeId> {
        nodes
            .into_iter()
            .filter(|n| {
                self.source_of(*n)
                    .is_some_and(|s| !book.sources_to_be_removed.contains(&s))
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // compile entry points
    // ------------------------------------------------------------------------

    /// Compile `sources` and everything invalidated since the last compile.
    pub fn compile(&self, sources: &[Arc<Source>]) -> Result<CompileReport> {
        self.compile_with(sources, self.options.incremental_validation, true)
    }

    /// Compile every source not compiled yet, with cold-start validation.
    pub fn compile_all(&self) -> Result<CompileReport> {
        let sources: Vec<Arc<Source>> = self
            .registry
            .sources()
            .into_iter()
            .filter(|s| !s.is_compiled())
            .collect();
        self.compile_with(&sources, self.options.cold_start_validation, true)
    }

    /// Compile inside the transaction open in the current thread. Nothing
    /// is committed or rolled back, and compiler event handlers are not run.
    pub fn compile_in_current_transaction(&self, sources: &[Arc<Source>]) -> Result<CompileReport> {
        if self.store.current_transaction().is_none() {
            return Err(CoreError::invalid_argument("No current transaction"));
        }
        self.compile_with(sources, self.options.incremental_validation, false)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(sources = sources.len(), mode = ?mode))]
    fn compile_with(&self, sources: &[Arc<Source>], mode: ValidationMode, notify: bool) -> Result<CompileReport> {
        let _compiling = self.compiling.lock();
        let start = Instant::now();

        let mut book = std::mem::take(&mut *self.bookkeeping.lock());
        let result = self.compile_scopes(&mut book, sources, mode);
        let processed = if result.is_ok() {
            std::mem::take(&mut book.processed)
        } else {
            IndexSet::new()
        };
        {
            let mut shared = self.bookkeeping.lock();
            let events = std::mem::take(&mut *shared);
            book.absorb(events);
            *shared = book;
        }

        let (scopes, mutation) = result?;
        let report = CompileReport {
            scopes: scopes.iter().map(|(scope, _)| scope.to_string()).collect(),
            sources: sources.iter().map(|s| s.id().clone()).collect(),
            new_instances: sources.iter().flat_map(|s| s.new_instances()).collect(),
            processed: processed.into_iter().collect(),
            mutation,
        };
        if notify {
            self.run_event_handlers(&report, sources);
        }
        tracing::info!(
            scopes = report.scopes.len(),
            sources = report.sources.len(),
            new_instances = report.new_instances.len(),
            processed = report.processed.len(),
            marked_for_deletion = report.mutation.marked_for_deletion().count(),
            elapsed_s = start.elapsed().as_secs_f64(),
            "compiled sources"
        );
        Ok(report)
    }

    /// The scopes to compile, in order, with the requested sources of each.
    fn plan(&self, book: &Bookkeeping, sources: &[Arc<Source>]) -> Vec<(Scope, Vec<Arc<Source>>)> {
        if sources.is_empty() || self.options.invalidation == InvalidationPolicy::WholeScope {
            return vec![(Scope::All, sources.to_vec())];
        }
        let potential: IndexSet<NodeId> = walk_for_unload(
            &self.store,
            self.passes.unload_walkers(),
            book.to_unload.iter().copied(),
        )
        .into_iter()
        .chain(book.to_process.iter().copied())
        .chain(book.to_unbind.iter().copied())
        .collect();

        let repositories: Vec<Option<SmolStr>> = sources
            .iter()
            .map(|s| s.repository().map(SmolStr::new))
            .chain(potential.iter().map(|n| self.repository_of(*n)))
            .collect();
        self.repositories
            .scopes(repositories.iter().map(Option::as_deref))
            .into_iter()
            .map(|scope| {
                let in_scope = sources
                    .iter()
                    .filter(|s| scope.contains(s.repository()))
                    .cloned()
                    .collect();
                (scope, in_scope)
            })
            .collect()
    }

    fn compile_scopes(
        &self,
        book: &mut Bookkeeping,
        sources: &[Arc<Source>],
        mode: ValidationMode,
    ) -> Result<(Vec<(Scope, Vec<Arc<Source>>)>, SourceMutation)> {
        let own_transactions = self.options.transactional_by_default && self.store.current_transaction().is_none();
        let plan = self.plan(book, sources);
        tracing::debug!(
            scopes = ?plan.iter().map(|(s, _)| s.to_string()).collect::<Vec<_>>(),
            "compile order"
        );

        // Unload runs inside the first transaction; if that one fails, the
        // bookkeeping goes back to this snapshot.
        let mut snapshot = own_transactions.then(|| book.clone());
        let mut mutation = SourceMutation::new();
        let total = plan.len();
        for (index, (scope, scope_sources)) in plan.iter().enumerate() {
            let states: Vec<SourceState> = book
                .old_source_states
                .iter()
                .filter(|s| !sources.is_empty() && scope.contains(s.source.repository()))
                .cloned()
                .collect();
            let transaction = own_transactions.then(|| self.store.new_transaction(true));
            let mut consolidated = Vec::new();
            let outcome = match transaction.as_ref().map(Transaction::open_in_current_thread).transpose() {
                Ok(_guard) => {
                    if index == 0 {
                        self.unload(book).and_then(|()| {
                            let remaining = self.without_removed_sources(book, book.to_process.iter().copied());
                            book.to_process = remaining;
                            self.compile_scope(book, scope, (index + 1, total), scope_sources, &states, mode, &mut consolidated)
                        })
                    } else {
                        self.compile_scope(book, scope, (index + 1, total), scope_sources, &states, mode, &mut consolidated)
                    }
                }
                Err(e) => Err(e.into()),
            };
            let first_snapshot = snapshot.take();
            match (outcome, transaction) {
                (Ok(scope_mutation), Some(transaction)) => {
                    transaction.commit()?;
                    mutation.merge(scope_mutation);
                }
                (Ok(scope_mutation), None) => mutation.merge(scope_mutation),
                (Err(cause), Some(transaction)) => {
                    return Err(self.roll_back(&transaction, cause, book, &consolidated, first_snapshot));
                }
                (Err(cause), None) => return Err(cause),
            }
        }
        Ok((plan, mutation))
    }

    // ------------------------------------------------------------------------
    // one scope
    // ------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(level = "debug", skip_all, fields(scope = %scope, sources = sources.len()))]
    fn compile_scope(
        &self,
        book: &mut Bookkeeping,
        scope: &Scope,
        (number, total): (usize, usize),
        sources: &[Arc<Source>],
        states: &[SourceState],
        mode: ValidationMode,
        consolidated_out: &mut Vec<NodeId>,
    ) -> Result<SourceMutation> {
        let start = Instant::now();
        self.parse_sources(sources, states)?;
        tracing::debug!(
            scope = %scope,
            number,
            total,
            sources = sources.len(),
            elapsed_s = start.elapsed().as_secs_f64(),
            "parsed sources"
        );

        let instances_to_process: IndexSet<NodeId> = book
            .to_process
            .iter()
            .copied()
            .filter(|n| self.in_scope(scope, *n))
            .collect();
        let instances_to_unbind: IndexSet<NodeId> = book
            .to_unbind
            .iter()
            .copied()
            .filter(|n| self.in_scope(scope, *n))
            .collect();

        let new_instances: IndexSet<NodeId> = sources.iter().flat_map(|s| s.new_instances()).collect();
        let old_instances: IndexSet<NodeId> = states.iter().flat_map(|s| s.instances.iter().copied()).collect();
        let new_but_not_old: IndexSet<NodeId> = new_instances.difference(&old_instances).copied().collect();
        let old_but_not_new: IndexSet<NodeId> = old_instances.difference(&new_instances).copied().collect();
        let sources_in_scope: FxHashSet<&SourceId> = sources.iter().map(|s| s.id()).collect();

        // Elements depending on nodes that were not reproduced, possibly in later scopes.
        let to_unbind_generated = walk_for_unload(&self.store, self.passes.unload_walkers(), old_but_not_new.iter().copied());
        let to_unbind_within: IndexSet<NodeId> = to_unbind_generated
            .iter()
            .copied()
            .filter(|n| self.in_scope(scope, *n))
            .collect();
        let here_unbind: IndexSet<NodeId> = to_unbind_within
            .iter()
            .chain(&old_but_not_new)
            .chain(&instances_to_unbind)
            .copied()
            .collect();
        let unbound = unbind(&self.store, &self.populator, here_unbind.iter().copied())?;
        if !here_unbind.is_empty() {
            let nodes: Vec<NodeId> = here_unbind.iter().copied().collect();
            for handler in self.handlers.read().iter() {
                handler.invalidate(&nodes);
            }
        }

        // A node of a parsed source survives only if parsing reproduced it.
        let keep = |n: &NodeId| match self.source_of(*n) {
            Some(source) if sources_in_scope.contains(&source) => new_instances.contains(n),
            _ => true,
        };
        let to_process_generated: IndexSet<NodeId> = to_unbind_generated.iter().copied().filter(keep).collect();
        let to_process_within: IndexSet<NodeId> = to_process_generated
            .iter()
            .copied()
            .filter(|n| self.in_scope(scope, *n))
            .collect();
        let process_filtered: IndexSet<NodeId> = instances_to_process.iter().copied().filter(keep).collect();
        let unbind_filtered: IndexSet<NodeId> = instances_to_unbind.iter().copied().filter(keep).collect();

        let candidates: IndexSet<NodeId> = self
            .without_removed_sources(
                book,
                to_process_within.iter().chain(&process_filtered).chain(&unbind_filtered).copied(),
            )
            .into_iter()
            .filter(|n| !old_but_not_new.contains(n))
            .collect();

        // Parsed nodes go last, in source order.
        let mut consolidated: Vec<NodeId> = candidates
            .iter()
            .copied()
            .filter(|n| !new_but_not_old.contains(n))
            .collect();
        consolidated.extend(
            sources
                .iter()
                .flat_map(|s| s.new_instances())
                .filter(|n| new_but_not_old.contains(n)),
        );
        let mut all_instances: Vec<NodeId> = candidates
            .iter()
            .copied()
            .filter(|n| !new_instances.contains(n))
            .collect();
        all_instances.extend(sources.iter().flat_map(|s| s.new_instances()));
        consolidated_out.extend(consolidated.iter().copied());

        tracing::debug!(
            scope = %scope,
            new = new_but_not_old.len(),
            removed = old_but_not_new.len(),
            unbound,
            consolidated = consolidated.len(),
            "computed compilation set"
        );

        let deferred: IndexSet<NodeId> = to_unbind_generated
            .iter()
            .copied()
            .filter(|n| !to_unbind_within.contains(n))
            .collect();
        let mutation = self.finish_scope(book, scope, &all_instances, &consolidated, &deferred, mode)?;

        // Old nodes are no longer referenced by anything bound.
        for &old in &old_but_not_new {
            if let Some(library) = self.passes.pattern_library() {
                library.unregister(old);
            }
            if let Some(package) = book.detached_from.remove(&old) {
                self.store.remove_empty_packages(package)?;
            }
            self.store.remove_subtree(old);
        }
        for old in &old_instances {
            book.detached_from.remove(old);
            book.to_unload.shift_remove(old);
        }
        book.old_source_states
            .retain(|s| !states.iter().any(|consumed| consumed.source == s.source));

        book.to_process.retain(|n| !old_but_not_new.contains(n));
        let carried: Vec<NodeId> = to_process_generated
            .iter()
            .copied()
            .filter(|n| {
                !to_process_within.contains(n) && !old_but_not_new.contains(n) && !consolidated.contains(n)
            })
            .collect();
        book.to_process.extend(self.without_removed_sources(book, carried));

        book.to_unbind.retain(|n| !here_unbind.contains(n));
        book.to_unbind.extend(
            to_unbind_generated
                .iter()
                .copied()
                .filter(|n| !to_unbind_within.contains(n)),
        );

        book.processed.extend(
            to_process_within
                .iter()
                .chain(&process_filtered)
                .chain(&unbind_filtered)
                .copied(),
        );

        if let Some(library) = self.passes.pattern_library() {
            for &node in &consolidated {
                library.possibly_register(node, &self.store);
            }
        }
        Ok(mutation)
    }

    fn parse_sources(&self, sources: &[Arc<Source>], states: &[SourceState]) -> Result<()> {
        let tx = self.store.current_transaction();
        parallel::for_each(
            self.pool(),
            tx.as_ref(),
            sources,
            self.options.thresholds.parse_sources,
            |source| {
                let mut ctx = ParseContext::new(&self.store, source.id().clone());
                if let Some(state) = states.iter().find(|s| &s.source == source.id()) {
                    ctx = ctx.with_previous_content(state.old_content.clone());
                }
                match self.parser.parse(source, &ctx) {
                    Ok(elements) => {
                        source.link_instances(elements);
                        source.set_compiled(true);
                        if let Some(tx) = &tx {
                            tx.note_source_compiled(source.id().clone());
                        }
                        Ok(())
                    }
                    Err(error) => {
                        if let Err(discard) = ctx.discard() {
                            tracing::warn!(source = %source.id(), error = %discard, "failed to discard partial parse");
                        }
                        Err(match error {
                            CoreError::Parse { .. } => error,
                            other => other.context(format!("Error parsing {}", source.id())),
                        })
                    }
                }
            },
        )
    }

    /// Register, bind, post-process and validate one scope's nodes.
    ///
    /// `deferred` holds dependents invalidated here but compiled by a later
    /// scope.
    fn finish_scope(
        &self,
        book: &mut Bookkeeping,
        scope: &Scope,
        all_instances: &[NodeId],
        consolidated: &[NodeId],
        deferred: &IndexSet<NodeId>,
        mode: ValidationMode,
    ) -> Result<SourceMutation> {
        let thresholds = &self.options.thresholds;
        let tx = self.store.current_transaction();

        let start = Instant::now();
        parallel::for_each(
            self.pool(),
            tx.as_ref(),
            all_instances,
            thresholds.context_registration,
            |node| self.store.register_in_context(*node),
        )?;
        tracing::debug!(
            instances = all_instances.len(),
            elapsed_s = start.elapsed().as_secs_f64(),
            "registered instances in context"
        );

        let start = Instant::now();
        let nodes: Vec<NodeId> = consolidated.iter().flat_map(|n| self.store.owned_subtree(*n)).collect();
        let passes = FixedPoint::new(&self.store, self.pool(), thresholds.resolve_references).run(&nodes)?;
        for &node in &nodes {
            self.populator.populate(node)?;
        }
        tracing::debug!(
            nodes = nodes.len(),
            passes,
            elapsed_s = start.elapsed().as_secs_f64(),
            "bound instances"
        );

        let start = Instant::now();
        let ctx = PassContext {
            store: &self.store,
            populator: &self.populator,
            repository: scope.repository(),
        };
        let mutation = self.passes.process(consolidated, &ctx)?;
        self.passes.populate_reference_usages(consolidated, &ctx)?;
        tracing::debug!(
            instances = consolidated.len(),
            elapsed_s = start.elapsed().as_secs_f64(),
            "post-processed instances"
        );

        let start = Instant::now();
        let mut diagnostics = Vec::new();
        if mode == ValidationMode::Deep {
            diagnostics.extend(
                self.check_graph(book, consolidated, deferred)
                    .into_iter()
                    .map(integrity_diagnostic),
            );
        }
        let validated: Vec<NodeId> = consolidated
            .iter()
            .copied()
            .filter(|n| !mutation.is_marked_for_deletion(*n))
            .collect();
        diagnostics.extend(self.passes.validate(&validated, mode, &ctx));
        let (errors, warnings): (Vec<Diagnostic>, Vec<Diagnostic>) =
            diagnostics.into_iter().partition(|d| d.severity == Severity::Error);
        for warning in &warnings {
            tracing::warn!(scope = %scope, diagnostic = %warning, "validation warning");
        }
        if !errors.is_empty() {
            return Err(CoreError::Validation(errors));
        }
        tracing::debug!(
            scope = %scope,
            ?mode,
            elapsed_s = start.elapsed().as_secs_f64(),
            "validated instances"
        );

        let excluded = self.store.rebuild_exclusion_set();
        tracing::debug!(excluded, "rebuilt exclusion set");

        for node in &validated {
            book.to_process.shift_remove(node);
        }
        book.sources_to_be_removed.clear();
        Ok(mutation)
    }

    /// Structural check of the whole graph, except the elements still
    /// waiting for unload or for a later scope.
    fn check_graph(&self, book: &Bookkeeping, consolidated: &[NodeId], deferred: &IndexSet<NodeId>) -> Vec<String> {
        let compiled: FxHashSet<NodeId> = consolidated.iter().copied().collect();
        let pending: FxHashSet<NodeId> = book
            .to_unload
            .iter()
            .chain(&book.to_unbind)
            .chain(&book.to_process)
            .chain(deferred)
            .filter(|n| !compiled.contains(n))
            .flat_map(|n| walk::owned_subtree(&self.store, *n, true))
            .collect();
        walk::check_nodes(
            &self.store,
            self.store.node_ids().into_iter().filter(|n| !pending.contains(n)),
        )
    }

    // ------------------------------------------------------------------------
    // unload and rollback
    // ------------------------------------------------------------------------

    /// Detach every node marked for unload. Nodes of removed sources, and
    /// nodes without a source, are deleted after their dependents are
    /// unbound; the others stay until their scope is recompiled.
    fn unload(&self, book: &mut Bookkeeping) -> Result<()> {
        if book.to_unload.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let removed: IndexSet<NodeId> = book
            .to_unload
            .iter()
            .copied()
            .filter(|n| {
                self.source_of(*n)
                    .is_none_or(|s| book.sources_to_be_removed.contains(&s))
            })
            .collect();

        let dependents = walk_for_unload(&self.store, self.passes.unload_walkers(), removed.iter().copied());
        unbind(
            &self.store,
            &self.populator,
            removed.iter().chain(&dependents).copied(),
        )?;
        book.to_unbind.extend(dependents.iter().copied());

        for &instance in &removed {
            if let Some(library) = self.passes.pattern_library() {
                library.unregister(instance);
            }
            if let Some(package) = self.store.detach_from_package(instance)? {
                self.store.remove_empty_packages(package)?;
            }
            self.store.remove_from_context(instance);
            book.to_process.shift_remove(&instance);
            self.store.remove_subtree(instance);
        }

        let retained: Vec<NodeId> = book
            .to_unload
            .iter()
            .copied()
            .filter(|n| !removed.contains(n))
            .collect();
        for &instance in &retained {
            if let Some(package) = self.store.detach_from_package(instance)? {
                book.detached_from.insert(instance, package);
            }
            self.store.remove_from_context(instance);
            book.to_process.shift_remove(&instance);
        }
        book.to_unload.retain(|n| !removed.contains(n));

        tracing::debug!(
            removed = removed.len(),
            detached = retained.len(),
            dependents = dependents.len(),
            elapsed_s = start.elapsed().as_secs_f64(),
            "unloaded instances"
        );
        Ok(())
    }

    fn roll_back(
        &self,
        transaction: &Transaction,
        cause: CoreError,
        book: &mut Bookkeeping,
        consolidated: &[NodeId],
        snapshot: Option<Bookkeeping>,
    ) -> CoreError {
        match transaction.rollback() {
            Ok(report) => {
                for id in &report.compiled_sources {
                    if let Some(source) = self.registry.get_source(id) {
                        source.un_compile();
                    }
                }
                if let Some(snapshot) = snapshot {
                    *book = snapshot;
                }
                book.to_process
                    .extend(consolidated.iter().copied().filter(|n| self.store.contains(*n)));
                tracing::debug!(
                    error = %cause,
                    created = report.created_nodes.len(),
                    restored = report.restored_nodes,
                    sources = report.compiled_sources.len(),
                    "rolled back compilation"
                );
                cause
            }
            Err(rollback) => {
                tracing::error!(error = %cause, rollback = %rollback, "rollback after failed compilation failed");
                CoreError::RollbackFailed {
                    cause: Box::new(cause),
                    rollback,
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // notification
    // ------------------------------------------------------------------------

    fn run_event_handlers(&self, report: &CompileReport, sources: &[Arc<Source>]) {
        let handlers = self.handlers.read().clone();
        if handlers.is_empty() {
            return;
        }
        let mut by_repository: IndexMap<Option<SmolStr>, Vec<SourceId>> = IndexMap::new();
        for source in sources {
            by_repository
                .entry(source.repository().map(SmolStr::new))
                .or_default()
                .push(source.id().clone());
        }
        by_repository.sort_by(|a, _, b, _| self.repositories.compare(a.as_deref(), b.as_deref()));
        let by_repository: IndexMap<String, Vec<SourceId>> = by_repository
            .into_iter()
            .map(|(repository, ids)| {
                let name = repository.map_or_else(|| Scope::Unassigned.to_string(), |r| r.to_string());
                (name, ids)
            })
            .collect();

        let updated: Vec<NodeId> = report
            .new_instances
            .iter()
            .chain(&report.processed)
            .copied()
            .collect();
        for handler in &handlers {
            handler.compiled(&updated, &by_repository);
        }
    }
}

fn integrity_diagnostic(problem: String) -> Diagnostic {
    let code = if problem.contains("unresolved") {
        codes::UNRESOLVED_REFERENCE
    } else if problem.contains("dangling") {
        codes::DANGLING_EDGE
    } else {
        codes::OWNERSHIP_MISMATCH
    };
    Diagnostic::error(problem).with_code(code)
}

// ============================================================================
// SOURCE EVENTS
// ============================================================================

impl SourceEventHandler for IncrementalCompiler {
    fn update_source(&self, source: &Source, old_content: &str) {
        let mut book = self.bookkeeping.lock();
        if source.is_compiled() {
            book.old_source_states.push(SourceState {
                source: source.id().clone(),
                old_content: Arc::from(old_content),
                instances: source.new_instances(),
            });
        }
        book.mark_for_unload(source);
    }

    fn delete_source(&self, source: &Source) {
        if source.is_compiled() {
            let mut book = self.bookkeeping.lock();
            book.mark_for_unload(source);
            book.sources_to_be_removed.insert(source.id().clone());
        }
    }

    fn move_source(&self, source: &Source, _destination: &Source) {
        self.delete_source(source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::SourceSpan;
    use crate::graph::{NodeKind, Value, props};
    use crate::source::ElementsByParser;
    use pretty_assertions::assert_eq;

    /// One class per line: `pkg::Name field:pkg::Type ...`. A line
    /// starting with `!` is a parse error.
    struct LineParser;

    impl SourceParser for LineParser {
        fn name(&self) -> &str {
            "Pure"
        }

        fn parse(&self, source: &Source, ctx: &ParseContext<'_>) -> Result<ElementsByParser> {
            let mut elements = Vec::new();
            for (i, line) in source.content().lines().enumerate() {
                let line_no = i as i32 + 1;
                let span = SourceSpan::new(source.id().clone(), line_no, 1, line_no, line.len().max(1) as i32);
                let mut words = line.split_whitespace();
                let Some(path) = words.next() else { continue };
                let Some((package, name)) = path.rsplit_once("::").filter(|_| !path.starts_with('!')) else {
                    return Err(CoreError::parse(span, format!("expected a path, found '{path}'")));
                };
                let class = ctx.create_packaged_element(package, name, NodeKind::Class, span.clone())?;
                for field in words {
                    let (property, ty) = field
                        .split_once(':')
                        .ok_or_else(|| CoreError::parse(span.clone(), "expected name:type"))?;
                    let p = ctx.create_owned(class, props::PROPERTIES, NodeKind::Property, property, span.clone())?;
                    let g = ctx.create_owned(p, "genericType", NodeKind::GenericType, "", span.clone())?;
                    ctx.add_value(g, "rawType", Value::reference(ty))?;
                }
                elements.push(class);
            }
            Ok(ElementsByParser::from([(SmolStr::new("Pure"), elements)]))
        }
    }

    #[derive(Default)]
    struct Recorder {
        compiled: Mutex<Vec<(Vec<NodeId>, Vec<String>)>>,
        invalidated: Mutex<Vec<NodeId>>,
    }

    impl CompilerEventHandler for Recorder {
        fn compiled(&self, processed: &[NodeId], sources_by_repository: &IndexMap<String, Vec<SourceId>>) {
            self.compiled
                .lock()
                .push((processed.to_vec(), sources_by_repository.keys().cloned().collect()));
        }

        fn invalidate(&self, nodes: &[NodeId]) {
            self.invalidated.lock().extend_from_slice(nodes);
        }
    }

    struct Setup {
        store: GraphStore,
        registry: Arc<SourceRegistry>,
        compiler: Arc<IncrementalCompiler>,
    }

    fn setup(sources: &[(&str, &str)]) -> Setup {
        let store = GraphStore::new();
        let registry = Arc::new(SourceRegistry::new());
        for (id, content) in sources {
            registry.register_source(Source::new(*id, *content, false, true)).unwrap();
        }
        let compiler = IncrementalCompiler::builder(store.clone(), registry.clone(), Arc::new(LineParser)).build();
        Setup { store, registry, compiler }
    }

    fn type_of(store: &GraphStore, class: NodeId) -> Option<NodeId> {
        let property = store.with_node(class, |n| n.targets(props::PROPERTIES).next())??;
        let generic = store.with_node(property, |n| n.targets("genericType").next())??;
        store.with_node(generic, |n| n.targets("rawType").next())?
    }

    fn usages(store: &GraphStore, node: NodeId) -> usize {
        store
            .with_node(node, |n| n.values(props::REFERENCE_USAGES).len())
            .unwrap_or(0)
    }

    const X: (&str, &str) = ("/m/x.pure", "a::X\n");
    const Y: (&str, &str) = ("/m/y.pure", "a::Y x:a::X\n");

    #[test]
    fn test_compile_all_binds_references() {
        let s = setup(&[X, Y]);
        let report = s.compiler.compile_all().unwrap();
        assert_eq!(report.scopes, vec!["m".to_string()]);

        let x = s.store.find_by_path("a::X").unwrap();
        let y = s.store.find_by_path("a::Y").unwrap();
        assert_eq!(report.new_instances, vec![x, y]);
        assert_eq!(type_of(&s.store, y), Some(x));
        assert_eq!(usages(&s.store, x), 1);
        assert!(s.registry.sources().iter().all(|src| src.is_compiled()));
        assert!(s.compiler.to_unload().is_empty());
    }

    #[test]
    fn test_edit_rebinds_dependents() {
        let s = setup(&[X, Y]);
        s.compiler.compile_all().unwrap();
        let old_x = s.store.find_by_path("a::X").unwrap();
        let y = s.store.find_by_path("a::Y").unwrap();

        assert!(s.registry.update_content(&SourceId::new(X.0), "\na::X\n").unwrap());
        assert_eq!(s.compiler.to_unload(), vec![old_x]);

        let report = s.compiler.compile_all().unwrap();
        let new_x = s.store.find_by_path("a::X").unwrap();
        assert_ne!(new_x, old_x);
        assert!(!s.store.contains(old_x));
        assert_eq!(report.processed, vec![y]);
        assert_eq!(type_of(&s.store, y), Some(new_x));
        assert_eq!(usages(&s.store, new_x), 1);
        assert!(s.compiler.to_unload().is_empty());
        assert!(s.compiler.to_unbind().is_empty());
    }

    #[test]
    fn test_rename_rolls_back() {
        let s = setup(&[X, Y]);
        s.compiler.compile_all().unwrap();
        let x = s.store.find_by_path("a::X").unwrap();
        let y = s.store.find_by_path("a::Y").unwrap();
        let nodes = s.store.node_count();

        s.registry.update_content(&SourceId::new(X.0), "a::X2\n").unwrap();
        let err = s.compiler.compile_all().unwrap_err();
        assert!(matches!(err, CoreError::Resolution { .. }), "{err}");
        assert!(err.to_string().contains("a::X"), "{err}");

        assert_eq!(s.store.find_by_path("a::X"), Some(x));
        assert_eq!(s.store.find_by_path("a::X2"), None);
        assert_eq!(s.store.node_count(), nodes);
        assert_eq!(type_of(&s.store, y), Some(x));
        assert!(!s.registry.get_source(&SourceId::new(X.0)).unwrap().is_compiled());
        assert_eq!(s.compiler.to_unload(), vec![x]);

        // Reverting the edit compiles cleanly.
        s.registry.update_content(&SourceId::new(X.0), "a::X\n\n").unwrap();
        s.compiler.compile_all().unwrap();
        let new_x = s.store.find_by_path("a::X").unwrap();
        assert_eq!(type_of(&s.store, y), Some(new_x));
        assert!(!s.store.contains(x));
    }

    #[test]
    fn test_parse_error_leaves_nothing() {
        let s = setup(&[("/m/bad.pure", "a::A\n!oops\n")]);
        let nodes = s.store.node_count();
        let err = s.compiler.compile_all().unwrap_err();
        assert!(matches!(err, CoreError::Parse { .. }), "{err}");
        assert_eq!(s.store.node_count(), nodes);
        assert_eq!(s.store.find_by_path("a::A"), None);
    }

    #[test]
    fn test_delete_source_unbinds_dependents() {
        let s = setup(&[X, Y]);
        s.compiler.compile_all().unwrap();
        let x = s.store.find_by_path("a::X").unwrap();

        s.registry.delete_source(&SourceId::new(X.0), true).unwrap();
        assert_eq!(s.compiler.sources_to_be_removed(), vec![SourceId::new(X.0)]);
        let err = s.compiler.compile(&[]).unwrap_err();
        assert!(err.to_string().contains("a::X"), "{err}");
        assert_eq!(s.store.find_by_path("a::X"), Some(x));

        s.registry.delete_source(&SourceId::new(Y.0), true).unwrap();
        s.compiler.compile(&[]).unwrap();
        assert_eq!(s.store.find_by_path("a::X"), None);
        assert_eq!(s.store.find_by_path("a::Y"), None);
        assert_eq!(s.store.find_by_path("a"), None);
        assert!(s.compiler.sources_to_be_removed().is_empty());
    }

    #[test]
    fn test_event_handlers() {
        let s = setup(&[X, ("/z.pure", "b::Z y:a::Y\n"), Y]);
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn CompilerEventHandler> = recorder.clone();
        s.compiler.add_compiler_event_handler(handler.clone());

        let report = s.compiler.compile_all().unwrap();
        assert_eq!(report.scopes, vec!["m".to_string(), "non-repository".to_string()]);
        {
            let compiled = recorder.compiled.lock();
            assert_eq!(compiled.len(), 1);
            assert_eq!(compiled[0].1, vec!["m".to_string(), "non-repository".to_string()]);
            assert_eq!(compiled[0].0.len(), 3);
        }

        s.registry.update_content(&SourceId::new(X.0), "a::X\n\n").unwrap();
        s.compiler.compile_all().unwrap();
        let y = s.store.find_by_path("a::Y").unwrap();
        let z = s.store.find_by_path("b::Z").unwrap();
        // Z depends on X through Y.
        assert!(recorder.invalidated.lock().contains(&y));
        assert!(recorder.invalidated.lock().contains(&z));
        assert_eq!(type_of(&s.store, z), Some(y));

        s.compiler.remove_compiler_event_handler(&handler);
        s.registry.update_content(&SourceId::new(X.0), "a::X\n").unwrap();
        s.compiler.compile_all().unwrap();
        assert_eq!(recorder.compiled.lock().len(), 2);
    }

    #[test]
    fn test_compile_in_current_transaction() {
        let s = setup(&[X]);
        let source = s.registry.get_source(&SourceId::new(X.0)).unwrap();
        let err = s.compiler.compile_in_current_transaction(&[source.clone()]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));

        let tx = s.store.new_transaction(true);
        {
            let _guard = tx.open_in_current_thread().unwrap();
            s.compiler.compile_in_current_transaction(&[source.clone()]).unwrap();
        }
        assert!(s.store.find_by_path("a::X").is_some());
        assert_eq!(tx.compiled_sources(), vec![SourceId::new(X.0)]);
        tx.rollback().unwrap();
        assert_eq!(s.store.find_by_path("a::X"), None);
    }

    #[test]
    fn test_whole_scope_policy() {
        let store = GraphStore::new();
        let registry = Arc::new(SourceRegistry::new());
        registry.register_source(Source::new(X.0, X.1, false, true)).unwrap();
        registry.register_source(Source::new("/n/y.pure", Y.1, false, true)).unwrap();
        let compiler = IncrementalCompiler::builder(store.clone(), registry, Arc::new(LineParser))
            .with_options(CompilerOptions {
                invalidation: InvalidationPolicy::WholeScope,
                ..CompilerOptions::default()
            })
            .build();
        let report = compiler.compile_all().unwrap();
        assert_eq!(report.scopes, vec!["Pure".to_string()]);
        assert!(store.find_by_path("a::Y").is_some());
    }

    #[test]
    fn test_deep_validation_checks_the_whole_graph() {
        let store = GraphStore::new();
        let registry = Arc::new(SourceRegistry::new());
        registry.register_source(Source::new(X.0, X.1, false, true)).unwrap();
        registry.register_source(Source::new("/n/w.pure", "b::W\n", false, true)).unwrap();
        let compiler = IncrementalCompiler::builder(store.clone(), registry.clone(), Arc::new(LineParser))
            .with_options(CompilerOptions {
                incremental_validation: ValidationMode::Deep,
                ..CompilerOptions::default()
            })
            .build();
        compiler.compile_all().unwrap();

        // Break an element of `n`, then recompile a source of `m` only.
        let w = store.find_by_path("b::W").unwrap();
        store.add_value(w, "general", Value::reference("b::Missing")).unwrap();
        registry.update_content(&SourceId::new(X.0), "a::X\n\n").unwrap();
        let x_source = registry.get_source(&SourceId::new(X.0)).unwrap();
        let err = compiler.compile(&[x_source]).unwrap_err();

        let CoreError::Validation(diagnostics) = &err else {
            panic!("expected a validation error, got {err}");
        };
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].code.as_deref(), Some(codes::UNRESOLVED_REFERENCE));
        assert!(diagnostics[0].message.contains("b::Missing"), "{}", diagnostics[0].message);
    }

    #[test]
    fn test_exclusion_set_rebuilt_after_scope() {
        let s = setup(&[X]);
        s.compiler.compile_all().unwrap();
        let a = s.store.find_by_path("a").unwrap();
        assert!(s.store.is_excluded(a));
        assert!(!s.store.is_excluded(s.store.find_by_path("a::X").unwrap()));
    }

    #[test]
    fn test_reset() {
        let s = setup(&[X]);
        s.compiler.compile_all().unwrap();
        s.registry.update_content(&SourceId::new(X.0), "a::X\n\n").unwrap();
        assert_eq!(s.compiler.to_unload().len(), 1);
        s.compiler.reset();
        assert!(s.compiler.to_unload().is_empty());
    }
}
