use std::sync::Arc;
use telemux::transport::{MemoryBroker, MemoryTransport};
use telemux::TelemuxEngine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

mod helpers;
use helpers::*;

async fn get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[cfg(test)]
mod server_tests {
    use super::*;

    #[tokio::test]
    async fn test_health_reports_status_and_endpoints() {
        let engine = TelemuxEngine::new(&test_config(), Arc::new(MemoryTransport::new(MemoryBroker::new()))).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(telemux::server::serve(listener, engine.clone()));

        let _consumer = engine.hub.attach().await.unwrap();

        let response = get(addr, "/health").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        assert!(response.contains(r#""endpoints":1"#), "{}", response);
        assert!(response.contains(r#""status":"disconnected""#), "{}", response);
        assert!(response.contains(r#""transport":"memory""#), "{}", response);
    }

    #[tokio::test]
    async fn test_plain_get_on_ws_is_not_upgraded() {
        let engine = TelemuxEngine::new(&test_config(), Arc::new(MemoryTransport::new(MemoryBroker::new()))).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(telemux::server::serve(listener, engine.clone()));

        let response = get(addr, "/ws").await;
        assert!(!response.starts_with("HTTP/1.1 101"), "{}", response);
        assert_eq!(engine.hub.endpoint_count().await.unwrap(), 0);
    }
}
