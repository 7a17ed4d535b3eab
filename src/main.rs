use anyhow::Context;
use energymeter_mqtt_bridge::{
    Bridge, Config, DeviceState, Heartbeat, LogPublisher, MeterIdentity, MqttIngress,
    PhaseLine, Publisher,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_modbus::server::tcp::{accept_tcp_connection, Server};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    tracing_subscriber::fmt()
        .with_max_level(config.log_level()?)
        .init();

    info!(name = %config.name, "Starting energy meter MQTT bridge");
    let phases = config.phases();
    for phase in &phases {
        info!(phase = %phase.name, "Configuration found");
    }

    if config.dryrun {
        warn!("Dry run, device state disabled");
        return run(config, phases, LogPublisher).await;
    }

    let (device_state, device_handle) = DeviceState::new(&MeterIdentity::new(&config.name));
    if let Some(socket_addr) = config.modbus.listen {
        tokio::spawn(async move {
            if let Err(e) = server_context(socket_addr, device_state).await {
                error!(error = %e, "Modbus server stopped");
            }
        });
    }

    run(config, phases, device_handle).await
}

async fn run<P: Publisher + 'static>(
    config: Config,
    phases: Vec<PhaseLine>,
    publisher: P,
) -> anyhow::Result<()> {
    let bridge = Arc::new(Bridge::new(
        phases,
        config.factors,
        config.derived,
        publisher,
    ));
    let _heartbeat = Heartbeat::new(Arc::clone(&bridge), config.log_interval()).spawn();
    let ingress = MqttIngress::new(&config.mqtt, bridge);

    tokio::select! {
        result = ingress.run() => result.context("MQTT ingress stopped"),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}

async fn server_context(socket_addr: SocketAddr, device_state: DeviceState) -> anyhow::Result<()> {
    info!(%socket_addr, "Serving meter registers over Modbus TCP");
    let listener = TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("Failed to bind {socket_addr}"))?;
    let server = Server::new(listener);
    let new_service = |_socket_addr| Ok(Some(device_state.clone()));
    let on_connected = |stream, socket_addr| async move {
        accept_tcp_connection(stream, socket_addr, new_service)
    };
    let on_process_error = |err| {
        warn!("Modbus connection error: {err}");
    };
    server.serve(&on_connected, on_process_error).await?;
    Ok(())
}
