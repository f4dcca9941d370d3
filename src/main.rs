//! Entry point for the check controller binary

mod args;

use std::sync::Arc;

use check_controller::config::Config;
use check_controller::escalate::email::EmailEscalator;
use check_controller::escalate::slack::SlackEscalator;
use check_controller::escalate::{ClusterContext, EscalatorRegistry};
use check_controller::k8s::{crd, KubeClusterClient};
use check_controller::metrics_sink::{MetricsSink, NullSink, PushgatewaySink};
use check_controller::Controller;

use args::{Args, SubCommands};
use clap::Parser;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let code = match &args.cmd {
        SubCommands::Run(run_args) => run(run_args).await,
    };
    std::process::exit(code);
}

async fn run(run_args: &args::RunArgs) -> i32 {
    let mut config = match Config::load(run_args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "failed to load configuration");
            return check_controller::controller::EXIT_CODE_FATAL;
        }
    };
    if let Some(gateway) = &run_args.prometheus_gateway {
        config.prometheus_gateway = Some(gateway.clone());
    }

    let client = match kube::Client::try_default().await {
        Ok(client) => client,
        Err(err) => {
            tracing::error!(%err, "failed to build kube client");
            return check_controller::controller::EXIT_CODE_FATAL;
        }
    };

    if run_args.install_crd {
        if let Err(err) = crd::create_or_update(&client).await {
            tracing::error!(%err, "failed to install Check CRD");
            return check_controller::controller::EXIT_CODE_FATAL;
        }
    }

    let cluster = Arc::new(KubeClusterClient::new(client));

    let mut escalators = EscalatorRegistry::new(ClusterContext::from_env());
    escalators.register("slack", Box::new(SlackEscalator::new()));
    if let Some(api_key) = &config.sendgrid_api_key {
        escalators.register("email", Box::new(EmailEscalator::new(api_key.clone())));
    }
    let escalators = Arc::new(escalators);

    let metrics_sink: Arc<dyn MetricsSink> = match &config.prometheus_gateway {
        Some(gateway) => Arc::new(PushgatewaySink::new(gateway.clone())),
        None => Arc::new(NullSink::default()),
    };

    let controller = Controller::new(cluster, escalators, metrics_sink, config);
    controller.run().await
}
