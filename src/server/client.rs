use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::core::error::{Error, Result};
use crate::server::proto::{
    NetWriter, CLIENT_VERSION, COMMAND_EXCERPT, COMMAND_KEYWORDS, COMMAND_PERSIST,
    COMMAND_QUERY, COMMAND_SEARCH, COMMAND_STATUS, COMMAND_UPDATE, SEARCHD_PROTO,
    STATUS_ERROR, STATUS_OK, STATUS_RETRY, VER_COMMAND_KEYWORDS, VER_COMMAND_QUERY,
    VER_COMMAND_SEARCH, VER_COMMAND_STATUS, VER_COMMAND_UPDATE,
};
use crate::server::{handlers, mysql, Protocol, ServerCtx};

/// Entry point for one accepted connection; dispatches by listener
/// protocol and enforces `max_children`.
pub async fn serve_connection(
    ctx: Arc<ServerCtx>,
    mut stream: TcpStream,
    peer: SocketAddr,
    protocol: Protocol,
) {
    ctx.stats.connections.fetch_add(1, Ordering::Relaxed);

    let active = ctx.active_clients.fetch_add(1, Ordering::SeqCst) + 1;
    if active > ctx.config.searchd.max_children {
        ctx.stats.maxed_out.fetch_add(1, Ordering::Relaxed);
        warn!("maxed out, dismissing client {}", peer);
        if protocol == Protocol::Sphinx {
            let _ = send_maxed_out(&mut stream).await;
        }
        ctx.active_clients.fetch_sub(1, Ordering::SeqCst);
        return;
    }

    let outcome = match protocol {
        Protocol::Sphinx => serve_sphinx(&ctx, &mut stream).await,
        Protocol::Mysql41 => mysql::serve_mysql(&ctx, &mut stream).await,
    };
    if let Err(e) = outcome {
        debug!("client {}: {}", peer, e);
    }
    ctx.active_clients.fetch_sub(1, Ordering::SeqCst);
}

async fn send_maxed_out(stream: &mut TcpStream) -> Result<()> {
    stream.write_u32(SEARCHD_PROTO).await?;
    let message = "server maxed out, retry in a second";
    let mut w = NetWriter::new();
    w.put_u16(STATUS_RETRY);
    w.put_u16(0);
    w.put_u32(4 + message.len() as u32);
    w.put_string(message);
    stream.write_all(&w.into_bytes()).await?;
    Ok(())
}

/// Major versions must match; the client's minor may be older.
fn check_command_version(client: u16, server: u16) -> Result<()> {
    if client >> 8 != server >> 8 || (client & 0xFF) > (server & 0xFF) {
        return Err(Error::protocol(format!(
            "client version 0x{:x} is incompatible with server version 0x{:x}",
            client, server)));
    }
    Ok(())
}

async fn serve_sphinx(ctx: &Arc<ServerCtx>, stream: &mut TcpStream) -> Result<()> {
    let read_timeout = Duration::from_secs(ctx.config.searchd.read_timeout_secs.max(1));

    stream.write_u32(SEARCHD_PROTO).await?;
    let client_version = tokio::time::timeout(read_timeout, stream.read_u32())
        .await
        .map_err(|_| Error::protocol("client handshake timed out".to_string()))??;
    if client_version < CLIENT_VERSION {
        return Err(Error::protocol(format!(
            "client protocol version {} is too old", client_version)));
    }

    let mut persistent = false;
    loop {
        // command frame: u16 command, u16 version, u32 body length
        let mut header = [0u8; 8];
        let read = if persistent {
            // persistent clients may idle between commands
            stream.read_exact(&mut header).await
        } else {
            match tokio::time::timeout(read_timeout, stream.read_exact(&mut header)).await {
                Ok(r) => r,
                Err(_) => return Err(Error::protocol("client request timed out".to_string())),
            }
        };
        if read.is_err() {
            return Ok(()); // client closed the connection
        }

        let command = u16::from_be_bytes([header[0], header[1]]);
        let version = u16::from_be_bytes([header[2], header[3]]);
        let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if length > ctx.config.searchd.max_packet_size {
            send_error(stream, version, &format!("oversized packet ({} bytes)", length)).await?;
            return Ok(());
        }
        let mut body = vec![0u8; length];
        tokio::time::timeout(read_timeout, stream.read_exact(&mut body))
            .await
            .map_err(|_| Error::protocol("request body timed out".to_string()))??;

        ctx.stats.count_command(command);

        let (ver, outcome) = match command {
            COMMAND_SEARCH => (
                VER_COMMAND_SEARCH,
                match check_command_version(version, VER_COMMAND_SEARCH) {
                    Ok(()) => handlers::handle_search(ctx, &body).await,
                    Err(e) => Err(e),
                },
            ),
            COMMAND_UPDATE => (
                VER_COMMAND_UPDATE,
                match check_command_version(version, VER_COMMAND_UPDATE) {
                    Ok(()) => handlers::handle_update(ctx, &body).await,
                    Err(e) => Err(e),
                },
            ),
            COMMAND_KEYWORDS => (
                VER_COMMAND_KEYWORDS,
                match check_command_version(version, VER_COMMAND_KEYWORDS) {
                    Ok(()) => handlers::handle_keywords(ctx, &body).await,
                    Err(e) => Err(e),
                },
            ),
            COMMAND_STATUS => (VER_COMMAND_STATUS, handlers::handle_status(ctx).await),
            COMMAND_QUERY => (
                VER_COMMAND_QUERY,
                match check_command_version(version, VER_COMMAND_QUERY) {
                    Ok(()) => mysql::handle_wrapped_query(ctx, &body).await,
                    Err(e) => Err(e),
                },
            ),
            COMMAND_PERSIST => {
                // no reply; just flip the connection mode
                let mut r = crate::server::proto::NetReader::new(&body);
                persistent = r.read_u32().unwrap_or(0) != 0;
                continue;
            }
            COMMAND_EXCERPT => (
                0,
                Err(Error::query("excerpts are not supported".to_string())),
            ),
            other => (
                0,
                Err(Error::protocol(format!("unknown command {}", other))),
            ),
        };

        match outcome {
            Ok(writer) => {
                let payload = writer.into_bytes();
                let mut head = NetWriter::new();
                head.put_u16(STATUS_OK);
                head.put_u16(ver);
                head.put_u32(payload.len() as u32);
                stream.write_all(&head.into_bytes()).await?;
                stream.write_all(&payload).await?;
            }
            Err(e) => {
                // query-level problems keep the connection open;
                // protocol-level ones close it after the reply
                let fatal = e.kind == crate::core::error::ErrorKind::Protocol;
                send_error(stream, ver, &e.context).await?;
                if fatal {
                    return Ok(());
                }
            }
        }

        if !persistent {
            return Ok(());
        }
    }
}

async fn send_error(stream: &mut TcpStream, version: u16, message: &str) -> Result<()> {
    let mut w = NetWriter::new();
    w.put_u16(STATUS_ERROR);
    w.put_u16(version);
    w.put_u32(4 + message.len() as u32);
    w.put_string(message);
    stream.write_all(&w.into_bytes()).await?;
    Ok(())
}
