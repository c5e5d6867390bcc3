//! Change orchestration
//!
//! One accepted record walks
//! `Received → Validated → Persisted → MainOverwritten → ImpactComputed → FannedOut → Merged`.
//! Failures before persistence fail the whole request. After persistence the
//! main resource's errors are kept, and each impacted resource's errors are
//! downgraded to warnings so one broken dependent cannot fail the caller.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use netfence_common::resource_id::same_id;
use netfence_common::{
    NetworkRestrictionSettings, ResourceDependencyInformation, ResultObject, RuleSet,
};
use netfence_graph::DependencyStore;

use crate::kinds::ResourceKind;
use crate::rules::RuleEngine;
use crate::validation::Validator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Received,
    Validated,
    Persisted,
    MainOverwritten,
    ImpactComputed,
    FannedOut,
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Success,
    /// Persisted, but the main resource reported errors
    PartialSuccess,
    Failed,
}

/// Final state of one request: the last stage reached and the merged result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub outcome: Outcome,
    pub stage: Stage,
    pub result: ResultObject,
}

impl Completion {
    fn failed(stage: Stage, result: ResultObject) -> Self {
        Self {
            outcome: Outcome::Failed,
            stage,
            result,
        }
    }

    fn finished(stage: Stage, result: ResultObject) -> Self {
        let outcome = if result.success() {
            Outcome::Success
        } else {
            Outcome::PartialSuccess
        };
        Self {
            outcome,
            stage,
            result,
        }
    }
}

#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn DependencyStore>,
    engine: Arc<RuleEngine>,
    validator: Arc<Validator>,
    permits: Arc<Semaphore>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn DependencyStore>,
        engine: Arc<RuleEngine>,
        validator: Arc<Validator>,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            engine,
            validator,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Accept a new or changed record and converge everything it touches.
    /// Records with `printOut` set are previewed instead.
    pub async fn apply(&self, record: ResourceDependencyInformation) -> Completion {
        let id = record.resource_id.trim().to_string();
        let mut result = ResultObject::for_operation("apply", &id);
        info!("Received dependency record for {id}");

        match self.validator.validate(&record).await {
            Ok(validation) => result.merge(validation),
            Err(e) => result.fail(&format!("validating {id}"), &e),
        }
        if !result.success() {
            warn!("Rejected record for {id}: {} validation errors", result.errors.len());
            return Completion::failed(Stage::Received, result);
        }
        if record.print_out {
            return self.preview(&record, result).await;
        }

        let previous = match self.store.get(&id).await {
            Ok(previous) => previous,
            Err(e) => {
                result.fail(&format!("reading the stored record for {id}"), &e);
                return Completion::failed(Stage::Validated, result);
            }
        };
        if let Err(e) = self.store.upsert(&record).await {
            result.fail(&format!("storing the record for {id}"), &e);
            return Completion::failed(Stage::Validated, result);
        }
        debug!("{id}: {:?}", Stage::Persisted);

        self.update_unmanaged_targets(&record, previous.as_ref(), &mut result)
            .await;
        result.merge(self.overwrite(&record).await);
        debug!("{id}: {:?}", Stage::MainOverwritten);

        let mut impacted = match self.impacted_by(&record).await {
            Ok(impacted) => impacted,
            Err(e) => {
                result.warning(format!(
                    "dependents of {id} could not be determined: {}",
                    e.user_message()
                ));
                BTreeMap::new()
            }
        };
        if let Some(previous) = &previous {
            // targets dropped from the outbound list lose the reverse grant
            for target in &previous.allow_outbound.resource_ids {
                if !record.references_outbound(target) {
                    self.add_managed(target, &mut impacted, &mut result).await;
                }
            }
        }
        impacted.remove(&record.document_id());
        debug!("{id}: {:?} ({} dependents)", Stage::ImpactComputed, impacted.len());

        self.fan_out(impacted.into_values().collect(), &mut result)
            .await;
        debug!("{id}: {:?}", Stage::FannedOut);
        Completion::finished(Stage::Merged, result)
    }

    /// Drop a resource from the graph and converge its former neighbours
    pub async fn remove(&self, resource_id: &str) -> Completion {
        let id = resource_id.trim();
        let mut result = ResultObject::for_operation("remove", id);
        info!("Removing dependency record for {id}");

        let previous = match self.store.get(id).await {
            Ok(previous) => previous,
            Err(e) => {
                result.fail(&format!("reading the stored record for {id}"), &e);
                return Completion::failed(Stage::Received, result);
            }
        };
        let mutated = match self.store.remove_config_and_dependencies(id).await {
            Ok(mutated) => mutated,
            Err(e) => {
                result.fail(&format!("removing {id}"), &e);
                return Completion::failed(Stage::Received, result);
            }
        };
        result.info(format!(
            "{id} removed, {} dependent record(s) rewritten",
            mutated.len()
        ));

        let mut impacted: BTreeMap<String, ResourceDependencyInformation> = mutated
            .into_iter()
            .map(|r| (r.document_id(), r))
            .collect();
        if let Some(previous) = &previous {
            let targets = &previous.allow_outbound.resource_ids;
            self.retract_from_unmanaged(id, targets, &mut result).await;
            for target in targets {
                self.add_managed(target, &mut impacted, &mut result).await;
            }
        }

        self.fan_out(impacted.into_values().collect(), &mut result)
            .await;
        Completion::finished(Stage::Merged, result)
    }

    /// An organization tag changed: converge every record that uses it
    pub async fn tag_changed(&self, tag: &str) -> Completion {
        let tag = tag.trim();
        let mut result = ResultObject::for_operation("tag_changed", tag);
        info!("Organization tag {tag} changed");

        let mut impacted: BTreeMap<String, ResourceDependencyInformation> =
            match self.store.find_by_tag_name(tag).await {
                Ok(explicit) => explicit.into_iter().map(|r| (r.document_id(), r)).collect(),
                Err(e) => {
                    result.fail(&format!("looking up records naming {tag}"), &e);
                    return Completion::failed(Stage::Received, result);
                }
            };
        debug!("{} record(s) name {tag} explicitly", impacted.len());

        // kind defaults and mandatory subscriptions never show up in the records
        let all = match self.store.get_all().await {
            Ok(all) => all,
            Err(e) => {
                result.fail("listing dependency records", &e);
                return Completion::failed(Stage::Received, result);
            }
        };
        for record in all {
            if impacted.contains_key(&record.document_id()) {
                continue;
            }
            match self.engine.implicitly_uses_tag(&record, tag).await {
                Ok(true) => {
                    impacted.insert(record.document_id(), record);
                }
                Ok(false) => {}
                Err(e) => {
                    result.warning(format!("{}: {}", record.resource_id, e.user_message()))
                }
            }
        }
        info!("Tag {tag} is used by {} record(s)", impacted.len());

        self.fan_out(impacted.into_values().collect(), &mut result)
            .await;
        Completion::finished(Stage::Merged, result)
    }

    /// Recompute a record's rules and replace the live configuration of the
    /// resource and, for web sites, each deployment slot
    pub async fn overwrite(&self, record: &ResourceDependencyInformation) -> ResultObject {
        let id = record.resource_id.trim();
        let mut result = ResultObject::for_operation("overwrite", id);

        let kind = match ResourceKind::from_resource_id(id) {
            Ok(kind) => kind,
            Err(e) => {
                result.fail(id, &e);
                return result;
            }
        };
        let applier = match self.engine.appliers().get(kind) {
            Ok(applier) => applier,
            Err(e) => {
                result.fail(id, &e);
                return result;
            }
        };
        if let Err(e) = applier.check_provisioning_state(id).await {
            result.fail(&format!("{id} is not ready"), &e);
            return result;
        }

        let settings = match self.engine.compute_settings(record).await {
            Ok((settings, computed)) => {
                result.merge(computed);
                settings
            }
            Err(e) => {
                result.fail(&format!("computing rules for {id}"), &e);
                return result;
            }
        };
        if !result.success() {
            result.error(format!(
                "rules for {id} were not applied because rule computation reported errors"
            ));
            return result;
        }

        match applier.overwrite(&settings).await {
            Ok(applied) => result.merge(applied),
            Err(e) => {
                result.fail(&format!("overwriting {id}"), &e);
                return result;
            }
        }
        info!(
            "Overwrote {id} with {} main and {} scm rules",
            settings.main.len(),
            settings.scm.len()
        );

        if kind == ResourceKind::WebSite {
            self.overwrite_slots(id, &settings, &mut result).await;
        }
        result
    }

    /// Compute the settings a record would produce without touching anything
    async fn preview(
        &self,
        record: &ResourceDependencyInformation,
        mut result: ResultObject,
    ) -> Completion {
        let id = record.resource_id.trim();
        let applier = match ResourceKind::from_resource_id(id)
            .and_then(|kind| self.engine.appliers().get(kind))
        {
            Ok(applier) => applier,
            Err(e) => {
                result.fail(id, &e);
                return Completion::failed(Stage::Validated, result);
            }
        };
        let settings = match self.engine.compute_settings(record).await {
            Ok((settings, computed)) => {
                result.merge(computed);
                settings
            }
            Err(e) => {
                result.fail(&format!("computing rules for {id}"), &e);
                return Completion::failed(Stage::Validated, result);
            }
        };
        if !result.success() {
            return Completion::failed(Stage::Validated, result);
        }
        match applier.convert_to_print_out(&settings) {
            Ok(print_out) => {
                result.data = Some(print_out);
                Completion::finished(Stage::Validated, result)
            }
            Err(e) => {
                result.fail(&format!("previewing {id}"), &e);
                Completion::failed(Stage::Validated, result)
            }
        }
    }

    async fn overwrite_slots(
        &self,
        site: &str,
        settings: &NetworkRestrictionSettings,
        result: &mut ResultObject,
    ) {
        let slots = match self.engine.inventory().slots(site).await {
            Ok(slots) => slots,
            Err(e) => {
                result.fail(&format!("listing slots of {site}"), &e);
                return;
            }
        };
        let applier = match self.engine.appliers().get(ResourceKind::WebSiteSlot) {
            Ok(applier) => applier,
            Err(e) => {
                result.fail(site, &e);
                return;
            }
        };
        for slot in slots {
            match applier.overwrite(&settings.retarget(&slot)).await {
                Ok(applied) => {
                    debug!("Overwrote slot {slot}");
                    result.merge(applied);
                }
                Err(e) => result.fail(&format!("overwriting slot {slot}"), &e),
            }
        }
    }

    /// Managed records whose rules depend on `record`: those listing it
    /// inbound, those listing it outbound, and its own managed outbound targets
    async fn impacted_by(
        &self,
        record: &ResourceDependencyInformation,
    ) -> netfence_common::Result<BTreeMap<String, ResourceDependencyInformation>> {
        let id = &record.resource_id;
        let mut impacted = BTreeMap::new();
        for dependent in self.store.get_configs_where_inbound(id).await? {
            impacted.insert(dependent.document_id(), dependent);
        }
        for dependent in self.store.get_configs_where_outbound(id).await? {
            impacted.insert(dependent.document_id(), dependent);
        }
        for target in &record.allow_outbound.resource_ids {
            if let Some(managed) = self.store.get(target).await? {
                impacted.insert(managed.document_id(), managed);
            }
        }
        debug!("{} record(s) impacted by {id}", impacted.len());
        Ok(impacted)
    }

    async fn add_managed(
        &self,
        resource_id: &str,
        impacted: &mut BTreeMap<String, ResourceDependencyInformation>,
        result: &mut ResultObject,
    ) {
        match self.store.get(resource_id).await {
            Ok(Some(managed)) => {
                impacted.insert(managed.document_id(), managed);
            }
            Ok(None) => {}
            Err(e) => result.warning(format!("{resource_id}: {}", e.user_message())),
        }
    }

    /// Overwrite every impacted record concurrently and fold the results in
    /// document-id order, errors downgraded per dependent
    async fn fan_out(
        &self,
        records: Vec<ResourceDependencyInformation>,
        result: &mut ResultObject,
    ) {
        if records.is_empty() {
            return;
        }
        let expected = records.len();
        info!("Fanning out to {expected} dependent record(s)");

        let mut tasks = JoinSet::new();
        for record in records {
            let this = self.clone();
            tasks.spawn(async move {
                let _permit = this.permits.clone().acquire_owned().await;
                let outcome = this.overwrite(&record).await;
                (record.document_id(), record.resource_id, outcome)
            });
        }

        let mut merged = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((document_id, resource_id, outcome)) => {
                    merged.insert(document_id, (resource_id, outcome));
                }
                Err(e) => {
                    warn!("Dependent overwrite task failed: {e}");
                    result.warning(format!("a dependent overwrite did not complete: {e}"));
                }
            }
        }
        if merged.len() != expected {
            result.warning(format!(
                "{} of {expected} dependent results were collected",
                merged.len()
            ));
        }
        for (_, (resource_id, outcome)) in merged {
            if !outcome.success() {
                warn!("Dependent {resource_id} reported {} errors", outcome.errors.len());
            }
            result.merge(outcome.downgrade_errors(&resource_id));
        }
    }

    /// Append the source's rules to outbound targets netfence does not manage
    /// and retract them from targets dropped since the previous version
    async fn update_unmanaged_targets(
        &self,
        record: &ResourceDependencyInformation,
        previous: Option<&ResourceDependencyInformation>,
        result: &mut ResultObject,
    ) {
        let id = &record.resource_id;
        match self
            .engine
            .compute_append_rules_for_outbound_targets(record)
            .await
        {
            Ok((targets, computed)) => {
                result.merge(computed.downgrade_errors(id));
                for (target, rules) in targets {
                    self.append_to_unmanaged(id, &target, rules, None, result)
                        .await;
                }
            }
            Err(e) => result.warning(format!(
                "outbound rules for {id} could not be computed: {}",
                e.user_message()
            )),
        }

        let Some(previous) = previous else {
            return;
        };
        let dropped: Vec<String> = previous
            .allow_outbound
            .resource_ids
            .iter()
            .filter(|t| !record.references_outbound(t))
            .cloned()
            .collect();
        if !dropped.is_empty() {
            self.retract_from_unmanaged(id, &dropped, result).await;
        }
    }

    async fn retract_from_unmanaged(
        &self,
        source: &str,
        targets: &[String],
        result: &mut ResultObject,
    ) {
        if targets.is_empty() {
            return;
        }
        let rules = match self.engine.source_rules(source).await {
            Ok((rules, computed)) => {
                result.merge(computed.downgrade_errors(source));
                rules
            }
            Err(e) => {
                result.warning(format!(
                    "rules of {source} could not be computed for retraction: {}",
                    e.user_message()
                ));
                return;
            }
        };
        if rules.is_empty() {
            return;
        }
        for target in targets {
            if same_id(target, source) {
                continue;
            }
            self.append_to_unmanaged(source, target, RuleSet::new(), Some(rules.clone()), result)
                .await;
        }
    }

    async fn append_to_unmanaged(
        &self,
        source: &str,
        target: &str,
        add: RuleSet,
        delete: Option<RuleSet>,
        result: &mut ResultObject,
    ) {
        if add.is_empty() && delete.as_ref().map_or(true, RuleSet::is_empty) {
            return;
        }
        match self.store.get(target).await {
            Ok(Some(_)) => {
                debug!("{target} is managed, converging through its own record");
                return;
            }
            Ok(None) => {}
            Err(e) => {
                result.warning(format!("{target}: {}", e.user_message()));
                return;
            }
        }
        let applier = match ResourceKind::from_resource_id(target)
            .and_then(|kind| self.engine.appliers().get(kind))
        {
            Ok(applier) => applier,
            Err(e) => {
                result.warning(format!("{target}: {}", e.user_message()));
                return;
            }
        };

        let mut settings = NetworkRestrictionSettings::new(target, add, RuleSet::new());
        settings.main_delete = delete;
        match applier.append(&settings).await {
            Ok(applied) => {
                result.merge(applied.downgrade_errors(target));
                result.warning(format!(
                    "{target} is not managed by netfence; rules for {source} were changed on it directly"
                ));
                info!("Updated unmanaged target {target} for {source}");
            }
            Err(e) => result.warning(format!("{target}: {}", e.user_message())),
        }
    }
}
