use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_modbus::prelude::*;
use tokio_modbus::server::tcp::{accept_tcp_connection, Server};

use discovery::{scan_unit_ids, DiscoveryConfig, SCAN_REGISTER};
use modbus_client::ClientConfig;

/// Gateway where units 5..=9 expose the grid register and unit 5 is slow.
#[derive(Clone)]
struct SlowUnitGateway {
    slow_unit: u8,
    delay: Duration,
}

impl tokio_modbus::server::Service for SlowUnitGateway {
    type Request = SlaveRequest<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Exception>> + Send>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let SlaveRequest { slave, request } = req;
        let delay = if slave == self.slow_unit {
            self.delay
        } else {
            Duration::ZERO
        };
        let res = match request {
            Request::ReadHoldingRegisters(addr, 1) if addr == SCAN_REGISTER && (5..=9).contains(&slave) => {
                Ok(Response::ReadHoldingRegisters(vec![u16::from(slave)]))
            }
            Request::ReadHoldingRegisters(..) => Err(ExceptionCode::GatewayTargetDevice),
            _ => Err(ExceptionCode::IllegalFunction),
        };
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            res
        })
    }
}

async fn start_gateway(gateway: SlowUnitGateway) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let server = Server::new(listener);
    let new_service = move |_socket_addr| Ok(Some(gateway.clone()));
    let on_connected = move |stream, socket_addr| {
        let new_service = new_service.clone();
        async move { accept_tcp_connection(stream, socket_addr, new_service) }
    };
    let on_process_error = |err| {
        eprintln!("gateway error: {err}");
    };
    tokio::spawn(async move {
        let _ = server.serve(&on_connected, on_process_error).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

#[tokio::test]
async fn slow_unit_does_not_hide_the_next_one() {
    let addr = start_gateway(SlowUnitGateway {
        slow_unit: 5,
        delay: Duration::from_millis(400),
    })
    .await;
    let client_config = ClientConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        ..ClientConfig::default()
    };
    let config = DiscoveryConfig {
        unit_ids: 5..=9,
        per_unit_timeout_ms: 200,
    };

    let active = scan_unit_ids(client_config, config).await.expect("scan");
    assert_eq!(active, vec![6, 7, 8, 9]);
}

#[tokio::test]
async fn prompt_units_are_all_found() {
    let addr = start_gateway(SlowUnitGateway {
        slow_unit: 0,
        delay: Duration::ZERO,
    })
    .await;
    let client_config = ClientConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        ..ClientConfig::default()
    };
    let config = DiscoveryConfig {
        unit_ids: 1..=12,
        per_unit_timeout_ms: 200,
    };

    let active = scan_unit_ids(client_config, config).await.expect("scan");
    assert_eq!(active, vec![5, 6, 7, 8, 9]);
}
