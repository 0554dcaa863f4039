use std::{io, process::ExitCode, time::Duration};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use kube_port_forward::{
    exec_in_pod, start_forward, ForwardConfig, ForwardError, ForwardTarget, KubeApiEndpoint,
    KubeStreamProvider, NoPeerPolicy, DEFAULT_NAMESPACE,
};

#[derive(Parser, Debug)]
#[command(name = "kube-port-forward", about = "Forward local ports into cluster workloads")]
struct Cli {
    /// Base URL of the cluster API server.
    #[arg(long, env = "KUBE_API_SERVER")]
    api_server: String,

    /// Bearer token presented to the API server.
    #[arg(long, env = "KUBE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Forward a local port to a pod port until interrupted.
    Forward {
        /// Target in the form [namespace/]pod:local_port->remote_port
        target: String,

        /// Do not treat "<EOF>" in the inbound stream as end of input.
        #[arg(long)]
        no_sentinel: bool,

        /// Drop a local connection that stalls longer than this.
        #[arg(long)]
        peer_timeout_secs: Option<u64>,

        /// End the forward when the pod sends data and no local client is connected.
        #[arg(long)]
        fail_without_peer: bool,
    },
    /// Run a command in a pod container and print its output.
    Exec {
        pod: String,

        #[arg(long, short, default_value = DEFAULT_NAMESPACE)]
        namespace: String,

        #[arg(long, short, default_value = "server-img")]
        container: String,

        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,

        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to create async runtime: {}", err);
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> ExitCode {
    let mut endpoint = KubeApiEndpoint::new(cli.api_server);
    if let Some(token) = cli.token {
        endpoint = endpoint.with_bearer_token(token);
    }
    let provider = KubeStreamProvider::new(endpoint);

    match cli.command {
        Command::Forward {
            target,
            no_sentinel,
            peer_timeout_secs,
            fail_without_peer,
        } => {
            let target = match ForwardTarget::parse(&target) {
                Ok(target) => target,
                Err(err) => {
                    eprintln!("{}", err);
                    return ExitCode::from(2);
                }
            };

            let mut config = ForwardConfig::default();
            if no_sentinel {
                config = config.without_sentinel();
            }
            if let Some(secs) = peer_timeout_secs {
                config = config.with_peer_io_timeout(Duration::from_secs(secs));
            }
            if fail_without_peer {
                config = config.with_no_peer_policy(NoPeerPolicy::FailSession);
            }

            forward(&provider, target, config).await
        }
        Command::Exec {
            pod,
            namespace,
            container,
            timeout_secs,
            command,
        } => {
            let command = command.join(" ");
            let result = exec_in_pod(
                &provider,
                &pod,
                &namespace,
                &container,
                &command,
                Duration::from_secs(timeout_secs),
            )
            .await;

            match result {
                Ok(output) => {
                    print!("{}", output.stdout);
                    eprint!("{}", output.stderr);
                    match output.failure {
                        Some(failure) => {
                            eprintln!("Command failed in pod {}: {}", pod, failure);
                            ExitCode::FAILURE
                        }
                        None => ExitCode::SUCCESS,
                    }
                }
                Err(err) => {
                    eprintln!("Error executing command in pod {}: {}", pod, err);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

async fn forward(
    provider: &KubeStreamProvider,
    target: ForwardTarget,
    config: ForwardConfig,
) -> ExitCode {
    let mut handle = match start_forward(provider, target.to_request(), config).await {
        Ok(handle) => handle,
        Err(err) => return report(&err),
    };

    println!(
        "Forwarding {} -> {}/{}:{}",
        handle.local_addr(),
        target.namespace,
        target.pod_name,
        target.remote_port
    );

    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                tracing::warn!("Can not listen for Ctrl-C: {}", err);
            }
            None
        }
        result = handle.join() => Some(result),
    };

    let result = match finished {
        Some(result) => result,
        None => handle.stop().await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report(&err),
    }
}

fn report(err: &ForwardError) -> ExitCode {
    let message = match err {
        ForwardError::BindFailed { .. } => "Local port is not available",
        ForwardError::ChannelUnavailable { .. } => "Can not open port-forward channel to the pod",
        ForwardError::ChannelIo(_) => "Port-forward channel failed",
        ForwardError::NoActivePeer(_) => "Pod sent data while no local client was connected",
        ForwardError::PeerIo { .. } => "Local connection failed",
        ForwardError::SessionPanicked(_) => "Port-forward session terminated abnormally",
    };

    eprintln!("{} [{}]: {}", message, err.kind(), err);
    ExitCode::FAILURE
}
