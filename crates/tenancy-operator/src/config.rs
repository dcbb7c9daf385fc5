//! Command-line configuration
//!
//! Every flag has an environment fallback so the operator can be configured
//! from a Deployment manifest without touching its args.

use clap::{Args, Parser, Subcommand};

use tenancy_auth::AuthConfig;
use tenancy_common::telemetry::LogFormat;
use tenancy_common::{Error, TENANCY_SYSTEM_NAMESPACE};

/// Watches must time out before the client's 30s read timeout, otherwise
/// idle watches fail with "body read timed out".
const CLIENT_READ_TIMEOUT_SECS: u32 = 30;

/// Tenancy operator - propagates role templates into Kubernetes RBAC
#[derive(Parser, Debug)]
#[command(name = "tenancy-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Controller settings
    #[command(flatten)]
    pub controller: ControllerArgs,
}

/// Operator subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the controllers (default)
    Controller,
}

/// Settings for the controller process
#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// Server-side watch timeout in seconds, must stay below 30
    #[arg(long, env = "TENANCY_WATCH_TIMEOUT_SECS", default_value_t = 25)]
    pub watch_timeout_secs: u32,

    /// Requeue bindings that failed validation instead of waiting for a
    /// spec change
    #[arg(long, env = "TENANCY_RETRY_PERMANENT_ERRORS")]
    pub retry_permanent_errors: bool,

    /// Management-plane resources to also grant in the cluster namespace
    #[arg(
        long,
        env = "TENANCY_CLUSTER_NAMESPACE_RESOURCES",
        value_delimiter = ','
    )]
    pub cluster_namespace_resources: Vec<String>,

    /// Do not create the default business-owner and business-member
    /// templates on startup
    #[arg(long, env = "TENANCY_SKIP_DEFAULT_ROLES")]
    pub skip_default_roles: bool,

    /// Run controllers only while holding the leader lease (default)
    #[arg(long, overrides_with = "no_leader_election")]
    pub leader_election: bool,

    /// Run controllers without leader election
    #[arg(long, overrides_with = "leader_election")]
    pub no_leader_election: bool,

    /// Leader identity, normally the pod name
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    /// Namespace holding the leader lease
    #[arg(long, env = "TENANCY_NAMESPACE", default_value = TENANCY_SYSTEM_NAMESPACE)]
    pub lease_namespace: String,

    /// Log output format: json or text
    #[arg(long, env = "TENANCY_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,
}

impl ControllerArgs {
    /// Reject settings the controllers cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.watch_timeout_secs == 0 || self.watch_timeout_secs >= CLIENT_READ_TIMEOUT_SECS {
            return Err(Error::validation_for(
                "watch-timeout-secs",
                format!(
                    "must be between 1 and {}, got {}",
                    CLIENT_READ_TIMEOUT_SECS - 1,
                    self.watch_timeout_secs
                ),
            ));
        }
        if self.cluster_namespace_resources.iter().any(|r| r.trim().is_empty()) {
            return Err(Error::validation_for(
                "cluster-namespace-resources",
                "resource names must not be empty",
            ));
        }
        if self.lease_namespace.is_empty() {
            return Err(Error::validation_for("lease-namespace", "must not be empty"));
        }
        Ok(())
    }

    /// Whether controllers wait for the leader lease
    pub fn leader_election_enabled(&self) -> bool {
        !self.no_leader_election
    }

    /// Identity used in the leader lease
    pub fn identity(&self) -> String {
        self.pod_name
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| format!("tenancy-operator-{}", std::process::id()))
    }

    /// Reconciler switches derived from the flags
    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            retry_permanent_errors: self.retry_permanent_errors,
            cluster_namespace_resources: self
                .cluster_namespace_resources
                .iter()
                .map(|r| r.trim().to_string())
                .collect(),
        }
    }
}
