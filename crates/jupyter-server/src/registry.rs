//! Local view of the kernels running on the server.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::api::{
    KernelConnection, KernelModel, KernelSpec, KernelStatus, RunningKernel, ServerAddress,
    SessionModel,
};

/// Path of the connection file the server writes for `kernel_id`.
pub fn connection_file_path(runtime_dir: &Path, kernel_id: &str) -> PathBuf {
    runtime_dir.join(format!("kernel-{}.json", kernel_id))
}

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub removed: Vec<String>,
    pub adopted: Vec<String>,
    pub status_changed: Vec<(String, KernelStatus)>,
    pub sessions_changed: bool,
}

impl ReconcileOutcome {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
            && self.adopted.is_empty()
            && self.status_changed.is_empty()
            && !self.sessions_changed
    }
}

/// Kernels keyed by id, so there is never more than one handle per kernel.
///
/// Local inserts and removals bump a generation counter. A reconcile pass is
/// told the generation it started at and leaves alone any kernel inserted or
/// removed after that, since its listing predates the change.
#[derive(Debug, Default)]
pub struct KernelRegistry {
    kernels: HashMap<String, RunningKernel>,
    /// Specs the server advertises, for language lookup.
    catalog: HashMap<String, KernelSpec>,
    /// Spec names this process has started a kernel from.
    known_specs: HashSet<String>,
    sessions: Vec<SessionModel>,
    generation: u64,
    inserted_at: HashMap<String, u64>,
    removed_at: HashMap<String, u64>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the server's spec catalog. Listing a spec does not make
    /// kernels of it adoptable.
    pub fn remember_specs<'a>(&mut self, specs: impl IntoIterator<Item = &'a KernelSpec>) {
        for spec in specs {
            self.catalog.insert(spec.name.clone(), spec.clone());
        }
    }

    /// Make running kernels of spec `name` eligible for adoption.
    pub fn mark_spec_known(&mut self, name: &str) {
        self.known_specs.insert(name.to_string());
    }

    pub fn is_known_spec(&self, name: &str) -> bool {
        self.known_specs.contains(name)
    }

    fn language_of(&self, spec_name: &str) -> String {
        self.catalog
            .get(spec_name)
            .map(|s| s.language.clone())
            .unwrap_or_default()
    }

    /// Current generation. Take it before fetching a listing and pass it to
    /// [`KernelRegistry::reconcile`].
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn bump(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn get(&self, kernel_id: &str) -> Option<&RunningKernel> {
        self.kernels.get(kernel_id)
    }

    /// Snapshot of every kernel, ordered by id.
    pub fn kernels(&self) -> Vec<RunningKernel> {
        let mut kernels: Vec<_> = self.kernels.values().cloned().collect();
        kernels.sort_by(|a, b| a.kernel_id.cmp(&b.kernel_id));
        kernels
    }

    pub fn sessions(&self) -> &[SessionModel] {
        &self.sessions
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    fn handle_for(
        &self,
        model: &KernelModel,
        status: KernelStatus,
        server: &ServerAddress,
        runtime_dir: &Path,
    ) -> RunningKernel {
        RunningKernel {
            kernel_id: model.id.clone(),
            name: model.name.clone(),
            language: self.language_of(&model.name),
            status,
            connection: KernelConnection {
                server: server.clone(),
                connection_file: connection_file_path(runtime_dir, &model.id),
            },
        }
    }

    /// Register a kernel this process just started. Its spec becomes known.
    /// Returns false if the id was already registered.
    pub fn insert_started(
        &mut self,
        model: &KernelModel,
        server: &ServerAddress,
        runtime_dir: &Path,
    ) -> bool {
        if self.kernels.contains_key(&model.id) {
            return false;
        }
        self.mark_spec_known(&model.name);
        let handle = self.handle_for(model, KernelStatus::Starting, server, runtime_dir);
        self.kernels.insert(model.id.clone(), handle);
        let generation = self.bump();
        self.inserted_at.insert(model.id.clone(), generation);
        self.removed_at.remove(&model.id);
        true
    }

    pub fn remove(&mut self, kernel_id: &str) -> Option<RunningKernel> {
        let removed = self.kernels.remove(kernel_id)?;
        let generation = self.bump();
        self.inserted_at.remove(kernel_id);
        self.removed_at.insert(kernel_id.to_string(), generation);
        Some(removed)
    }

    /// Set a kernel's status. Returns true only if it changed.
    pub fn set_status(&mut self, kernel_id: &str, status: KernelStatus) -> bool {
        match self.kernels.get_mut(kernel_id) {
            Some(kernel) if kernel.status != status => {
                kernel.status = status;
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.kernels.clear();
        self.sessions.clear();
        self.inserted_at.clear();
        self.removed_at.clear();
    }

    /// Bring local handles in line with the server's listing.
    ///
    /// `since` is the generation taken before `live` was fetched. Kernels
    /// missing from `live` are dropped unless they were inserted after
    /// `since`. Unknown live kernels are only adopted when their spec is
    /// known and they were not removed after `since`. Running this twice with
    /// the same input changes nothing the second time.
    pub fn reconcile(
        &mut self,
        live: &[KernelModel],
        sessions: &[SessionModel],
        server: &ServerAddress,
        runtime_dir: &Path,
        since: u64,
    ) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        let live_ids: HashSet<&str> = live.iter().map(|k| k.id.as_str()).collect();

        let mut gone: Vec<String> = self
            .kernels
            .keys()
            .filter(|id| !live_ids.contains(id.as_str()))
            .filter(|id| self.inserted_at.get(id.as_str()).map_or(true, |g| *g <= since))
            .cloned()
            .collect();
        gone.sort();
        for id in gone {
            self.kernels.remove(&id);
            self.inserted_at.remove(&id);
            outcome.removed.push(id);
        }

        for model in live {
            if self.removed_at.get(&model.id).is_some_and(|g| *g > since) {
                continue;
            }
            let reported = model
                .execution_state
                .as_deref()
                .map(KernelStatus::from_execution_state)
                .unwrap_or_default();

            if self.kernels.contains_key(&model.id) {
                if reported != KernelStatus::Unknown && self.set_status(&model.id, reported) {
                    outcome.status_changed.push((model.id.clone(), reported));
                }
            } else if self.is_known_spec(&model.name) {
                let handle = self.handle_for(model, reported, server, runtime_dir);
                self.kernels.insert(model.id.clone(), handle);
                outcome.adopted.push(model.id.clone());
            }
        }

        if self.sessions != sessions {
            self.sessions = sessions.to_vec();
            outcome.sessions_changed = true;
        }

        // A removal this listing already reflects needs no more guarding.
        self.removed_at.retain(|_, g| *g > since);
        outcome
    }
}
