#![warn(missing_docs)]

//! rdmaflow: asynchronous RDMA connection and task-completion engine
//!
//! A [`Context`] owns connections and per-opcode task pools on one [`Device`]. Work is
//! submitted as tasks and completes through callbacks invoked from [`Context::progress`];
//! nothing runs in the background. Devices attach to an in-process [`Fabric`] that
//! carries handshakes, messages and one-sided operations between contexts.
//!
//! Task payloads live in [`ops`]; `ops::Send` is kept out of the crate root so it does
//! not shadow the `Send` marker trait in glob imports.
//!
//! ```
//! use rdmaflow::ops::Receive;
//! use rdmaflow::{Context, ContextState, Device, DeviceSpec, Fabric, UserData};
//!
//! let fabric = Fabric::new();
//! let spec = DeviceSpec::new("sim0").with_ipv4("10.0.0.1".parse().unwrap());
//! let device = Device::open(&fabric, spec).unwrap();
//! let mut ctx = Context::new(&device).unwrap();
//! ctx.set_task_conf::<Receive>(|_, _, _, _| {}, |_, _, _, _| {}, 4).unwrap();
//! ctx.start().unwrap();
//! ctx.progress().unwrap();
//! assert_eq!(ctx.state(), ContextState::Running);
//!
//! let task = ctx.allocate(Receive::new(None), UserData(1)).unwrap();
//! ctx.submit(task).unwrap();
//! assert_eq!(ctx.in_flight(), 1);
//! ```

pub mod address;
pub mod buffer;
pub mod cm;
pub mod config;
pub mod connection;
pub mod context;
pub mod details;
pub mod device;
pub mod driver;
pub mod engine;
pub mod error;
mod exec;
pub mod fabric;
pub mod metrics;
pub mod ops;
pub mod sync_event;
pub mod task;

pub use address::{AddrType, RdmaAddress};
pub use buffer::{BufList, BufRef, MemoryRegion, RemoteBuf};
pub use cm::{CmListener, CmRequest};
pub use config::{AccessFlags, Datapath, Mtu, RdmaConfig, TransportType};
pub use connection::{ConnectionId, ConnectionOrigin, ConnectionState};
pub use context::{AcceleratorHandle, ConnectionCallbacks, Context, ContextState};
pub use details::ConnectionDetails;
pub use device::{Device, DeviceCaps, DeviceInfo, DeviceSpec, Gid};
pub use driver::{drive_until, DriveConfig};
pub use engine::{Event, Events};
pub use error::{ErrorKind, RdmaError, Result};
pub use fabric::{DeviceId, EndpointId, Fabric, FabricStats};
pub use metrics::MetricsSnapshot;
pub use sync_event::{RemoteSyncEvent, SyncEvent};
pub use task::{ImmData, Operation, Task, TaskCallback, TaskHandle, TaskOpcode, TaskRef, TaskStatus, UserData};
