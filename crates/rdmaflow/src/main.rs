//! rdmaflow ping-pong demo over the in-process fabric

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rdmaflow::ops::{Receive, Send as SendOp};
use rdmaflow::{
    drive_until, AccessFlags, AddrType, BufList, ConnectionCallbacks, ConnectionId, ConnectionState, Context,
    Device, DeviceSpec, DriveConfig, Fabric, MemoryRegion, RdmaAddress, TaskHandle, UserData,
};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const PORT: u16 = 18515;
const ROUNDS: u64 = 8;
const MSG_SIZE: usize = 64;

fn post_receive(ctx: &mut Context, region: &Arc<MemoryRegion>) -> rdmaflow::Result<()> {
    let dst = BufList::from(region.buf(0, MSG_SIZE)?);
    let task = ctx.allocate(Receive::new(Some(dst)), UserData(0))?;
    ctx.submit(task)
}

fn send_text(ctx: &mut Context, conn: ConnectionId, region: &Arc<MemoryRegion>, text: &str) -> rdmaflow::Result<()> {
    let mut src = region.buf(0, MSG_SIZE)?;
    src.fill(text.as_bytes())?;
    let task = ctx.allocate(SendOp::new(conn, src), UserData(0))?;
    ctx.submit(task)
}

/// Reads the landed message and reposts the receive. Returns the text and the
/// connection it arrived on.
fn take_message(ctx: &mut Context, task: TaskHandle<Receive>) -> rdmaflow::Result<(String, Option<ConnectionId>)> {
    let done = ctx.task(task)?;
    let conn = done.op().result_connection();
    let text = done
        .op()
        .dst()
        .and_then(|dst| dst.bufs().first())
        .map(|buf| String::from_utf8_lossy(&buf.data()).into_owned())
        .unwrap_or_default();
    if let Some(dst) = ctx.task_mut(task)?.op_mut().dst_mut() {
        dst.reset();
    }
    ctx.submit(task)?;
    Ok((text, conn))
}

fn configure_sends(ctx: &mut Context) -> rdmaflow::Result<()> {
    ctx.set_task_conf::<SendOp>(
        |ctx, task, _, _| {
            if let Err(e) = ctx.free(task) {
                warn!(error = %e, "send task not freed");
            }
        },
        |ctx, task, _, _| {
            if let Ok(done) = ctx.task(task) {
                warn!(error = ?done.error(), "send failed");
            }
            if let Err(e) = ctx.free(task) {
                warn!(error = %e, "send task not freed");
            }
        },
        4,
    )
}

fn release_flushed(ctx: &mut Context, task: TaskHandle<Receive>, _: UserData, _: UserData) {
    debug!("receive flushed");
    if let Err(e) = ctx.free(task) {
        warn!(error = %e, "receive task not freed");
    }
}

fn server(device: &Device) -> anyhow::Result<Context> {
    let recv_mr = MemoryRegion::register(device, vec![0u8; MSG_SIZE], AccessFlags::default())?;
    let send_mr = MemoryRegion::register(device, vec![0u8; MSG_SIZE], AccessFlags::default())?;

    let mut ctx = Context::new(device)?;
    ctx.set_user_data(UserData(1));
    ctx.set_task_conf::<Receive>(
        move |ctx, task, _, _| match take_message(ctx, task) {
            Ok((text, Some(conn))) => {
                info!(%conn, %text, "server received");
                if let Err(e) = send_text(ctx, conn, &send_mr, "pong") {
                    warn!(error = %e, "pong not sent");
                }
            }
            Ok((_, None)) => warn!("message without connection"),
            Err(e) => warn!(error = %e, "server receive"),
        },
        release_flushed,
        4,
    )?;
    configure_sends(&mut ctx)?;
    ctx.set_connection_state_callbacks(
        ConnectionCallbacks::new()
            .on_request(|ctx, conn, _| {
                if let Err(e) = ctx.accept(conn, b"rdmaflow-demo") {
                    warn!(%conn, error = %e, "accept failed");
                }
            })
            .on_disconnection(|_, conn, _, _| info!(%conn, "server side disconnected")),
    )?;
    ctx.start()?;
    ctx.start_listen(PORT)?;
    post_receive(&mut ctx, &recv_mr)?;
    Ok(ctx)
}

fn client(device: &Device, pongs: Arc<AtomicU64>) -> anyhow::Result<Context> {
    let recv_mr = MemoryRegion::register(device, vec![0u8; MSG_SIZE], AccessFlags::default())?;
    let send_mr = MemoryRegion::register(device, vec![0u8; MSG_SIZE], AccessFlags::default())?;
    let first_mr = Arc::clone(&send_mr);

    let mut ctx = Context::new(device)?;
    ctx.set_user_data(UserData(2));
    ctx.set_task_conf::<Receive>(
        move |ctx, task, _, _| match take_message(ctx, task) {
            Ok((text, conn)) => {
                let seen = pongs.fetch_add(1, Ordering::AcqRel) + 1;
                info!(%text, round = seen, "client received");
                if let (true, Some(conn)) = (seen < ROUNDS, conn) {
                    if let Err(e) = send_text(ctx, conn, &send_mr, "ping") {
                        warn!(error = %e, "ping not sent");
                    }
                }
            }
            Err(e) => warn!(error = %e, "client receive"),
        },
        release_flushed,
        4,
    )?;
    configure_sends(&mut ctx)?;
    ctx.set_connection_state_callbacks(
        ConnectionCallbacks::new()
            .on_established(move |ctx, conn, _, _| {
                let greeting = ctx
                    .connection_private_data(conn)
                    .map(|data| String::from_utf8_lossy(data).into_owned())
                    .unwrap_or_default();
                info!(%conn, %greeting, "client connected");
                if let Err(e) = send_text(ctx, conn, &first_mr, "ping") {
                    warn!(error = %e, "ping not sent");
                }
            })
            .on_failure(|_, conn, error, _, _| warn!(%conn, %error, "connection failed"))
            .on_disconnection(|_, conn, _, _| info!(%conn, "client side disconnected")),
    )?;
    ctx.start()?;
    post_receive(&mut ctx, &recv_mr)?;
    Ok(ctx)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();
    run().await
}

async fn run() -> anyhow::Result<()> {
    let fabric = Fabric::new();
    let server_dev = Device::open(&fabric, DeviceSpec::new("sim-server").with_ipv4("192.168.100.1".parse()?))?;
    let client_dev = Device::open(&fabric, DeviceSpec::new("sim-client").with_ipv4("192.168.100.2".parse()?))?;

    let pongs = Arc::new(AtomicU64::new(0));
    let mut server = server(&server_dev)?;
    let mut client = client(&client_dev, Arc::clone(&pongs))?;

    let address = RdmaAddress::create(AddrType::Ipv4, "192.168.100.1", PORT)?;
    let conn = client.connect_to_addr(&address, UserData(7))?;

    let config = DriveConfig::default();
    let done = drive_until(&mut [&mut server, &mut client], &config, |_| {
        pongs.load(Ordering::Acquire) >= ROUNDS
    })
    .await?;
    if !done {
        anyhow::bail!("ping-pong did not finish within {:?}", config.timeout);
    }

    client.disconnect(conn)?;
    let done = drive_until(&mut [&mut server, &mut client], &config, |ctxs| {
        !matches!(ctxs[1].connection_state(conn), Ok(ConnectionState::Disconnecting))
    })
    .await?;
    if !done {
        anyhow::bail!("disconnect was not acknowledged");
    }

    for ctx in [&mut server, &mut client] {
        ctx.progress()?;
        ctx.stop()?;
        ctx.progress()?;
    }
    info!(
        client = %serde_json::to_string(&client.metrics())?,
        server = %serde_json::to_string(&server.metrics())?,
        "ping-pong finished"
    );
    Ok(())
}
