//! Controller runner - builds controller futures per registration phase
//!
//! Early controllers (binding lifecycle, Business sync) start first. Late
//! controllers (Business removal) start only once every Early controller
//! has listed its objects, so removal never runs against a Business whose
//! namespace and creator grant have not been looked at yet. The binding
//! index watchers start before any controller and must finish their first
//! listing, since the reconcilers read the index to find existing grants.

use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::reflector::Store;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};

use tenancy_auth::{binding_controller, business_controller, AuthContext, BindingIndex};
use tenancy_common::crd::{Business, BusinessRoleTemplateBinding};

use crate::config::ControllerArgs;

/// A running controller
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Resolves to true once a controller's cache holds its initial listing,
/// false if the controller stopped first
pub type ReadyFuture = Pin<Box<dyn Future<Output = bool> + Send>>;

/// Registration phase of a controller
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Grant-producing controllers
    Early,
    /// Cleanup controllers
    Late,
}

/// Controllers registered in one phase
pub struct PhaseControllers {
    /// Phase the controllers belong to
    pub phase: Phase,
    /// Controller futures, spawned when the phase starts
    pub controllers: Vec<ControllerFuture>,
    /// Readiness of the phase's caches; the next phase waits on all of them
    pub ready: Vec<ReadyFuture>,
}

fn store_ready<K>(store: Store<K>) -> ReadyFuture
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Send + Sync,
{
    Box::pin(async move { store.wait_until_ready().await.is_ok() })
}

/// Build the Early controllers: binding lifecycle and Business sync
pub fn build_early_controllers(
    client: Client,
    ctx: Arc<AuthContext>,
    watch_timeout_secs: u32,
) -> PhaseControllers {
    let bindings: Api<BusinessRoleTemplateBinding> = Api::all(client.clone());
    let binding_ctrl = Controller::new(
        bindings,
        WatcherConfig::default().timeout(watch_timeout_secs),
    );
    let binding_store = binding_ctrl.store();
    let binding_ctrl = binding_ctrl
        .shutdown_on_signal()
        .run(
            binding_controller::reconcile,
            binding_controller::error_policy,
            Arc::clone(&ctx),
        )
        .for_each(log_reconcile_result("BusinessRoleTemplateBinding"));

    let businesses: Api<Business> = Api::all(client);
    let business_ctrl = Controller::new(
        businesses,
        WatcherConfig::default().timeout(watch_timeout_secs),
    );
    let business_store = business_ctrl.store();
    let business_ctrl = business_ctrl
        .shutdown_on_signal()
        .run(
            business_controller::reconcile,
            business_controller::error_policy,
            ctx,
        )
        .for_each(log_reconcile_result("Business"));

    tracing::info!("- BusinessRoleTemplateBinding controller");
    tracing::info!("- Business sync controller");

    PhaseControllers {
        phase: Phase::Early,
        controllers: vec![Box::pin(binding_ctrl), Box::pin(business_ctrl)],
        ready: vec![store_ready(binding_store), store_ready(business_store)],
    }
}

/// Build the Late controllers: Business removal
pub fn build_late_controllers(
    client: Client,
    ctx: Arc<AuthContext>,
    watch_timeout_secs: u32,
) -> PhaseControllers {
    let businesses: Api<Business> = Api::all(client);
    let removal_ctrl = Controller::new(
        businesses,
        WatcherConfig::default().timeout(watch_timeout_secs),
    );
    let removal_store = removal_ctrl.store();
    let removal_ctrl = removal_ctrl
        .shutdown_on_signal()
        .run(
            business_controller::reconcile_removal,
            business_controller::error_policy,
            ctx,
        )
        .for_each(log_reconcile_result("BusinessRemoval"));

    tracing::info!("- Business removal controller");

    PhaseControllers {
        phase: Phase::Late,
        controllers: vec![Box::pin(removal_ctrl)],
        ready: vec![store_ready(removal_store)],
    }
}

/// Build every controller, one entry per phase
pub fn build_controllers(
    client: Client,
    ctx: Arc<AuthContext>,
    watch_timeout_secs: u32,
) -> Vec<PhaseControllers> {
    vec![
        build_early_controllers(client.clone(), Arc::clone(&ctx), watch_timeout_secs),
        build_late_controllers(client, ctx, watch_timeout_secs),
    ]
}

/// Start phases in order, each once the previous phase's caches are ready,
/// then wait for every controller to stop
///
/// If a phase stops before its caches become ready, later phases are not
/// started.
pub async fn run_phases(mut phases: Vec<PhaseControllers>) {
    phases.sort_by_key(|p| p.phase);
    let mut running = Vec::new();

    for PhaseControllers {
        phase,
        controllers,
        ready,
    } in phases
    {
        tracing::info!(?phase, count = controllers.len(), "starting controllers");
        running.extend(controllers.into_iter().map(tokio::spawn));

        let all_ready = futures::future::join_all(ready)
            .await
            .into_iter()
            .all(|ready| ready);
        if !all_ready {
            tracing::warn!(?phase, "controllers stopped before their caches were ready, not starting later phases");
            break;
        }
        tracing::debug!(?phase, "phase caches ready");
    }

    for result in futures::future::join_all(running).await {
        if let Err(e) = result {
            tracing::error!(error = %e, "controller task failed");
        }
    }
}

/// Start the index watchers, wait for them to sync, then run all
/// controllers until they stop
pub async fn run_controllers(client: Client, args: &ControllerArgs) {
    let index = Arc::new(BindingIndex::new());
    let watchers = index.spawn_watchers(
        client.clone(),
        Duration::from_secs(u64::from(args.watch_timeout_secs)),
    );

    tracing::info!("waiting for binding index to sync");
    index.wait_synced().await;
    tracing::info!("binding index synced, starting controllers");

    let ctx = Arc::new(AuthContext::from_client(
        client.clone(),
        index,
        args.auth_config(),
    ));
    run_phases(build_controllers(client, ctx, args.watch_timeout_secs)).await;

    for watcher in watchers {
        watcher.abort();
    }
    tracing::info!("controllers stopped");
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
