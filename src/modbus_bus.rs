use crate::bus::{AttributeSet, BusError, BusHandle, DeviceBus, ServiceSchema};
use crate::sunspec::{self, BASE_ADDRESS};
use std::{
    future,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_modbus::{
    prelude::*,
    server::tcp::{accept_tcp_connection, Server},
};
use tracing::{error, info, trace, warn};

/// Read-only Modbus view of the attribute tree.
#[derive(Clone)]
pub struct SunSpecRegisters {
    tree: Arc<Mutex<AttributeSet>>,
}

impl tokio_modbus::server::Service for SunSpecRegisters {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let res = match req {
            Request::ReadHoldingRegisters(addr, cnt) => {
                self.read(addr, cnt).map(Response::ReadHoldingRegisters)
            }
            Request::ReadInputRegisters(addr, cnt) => {
                self.read(addr, cnt).map(Response::ReadInputRegisters)
            }
            _ => {
                warn!(request = ?req, "Rejecting unsupported Modbus function");
                Err(ExceptionCode::IllegalFunction)
            }
        };
        future::ready(res)
    }
}

impl SunSpecRegisters {
    fn read(&self, addr: u16, cnt: u16) -> Result<Vec<u16>, ExceptionCode> {
        let image = sunspec::render(&lock(&self.tree));
        register_read(&image, addr, cnt)
    }
}

/// Serves `cnt` registers from an image that starts at [`BASE_ADDRESS`].
fn register_read(image: &[u16], addr: u16, cnt: u16) -> Result<Vec<u16>, ExceptionCode> {
    if cnt == 0 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let start = addr
        .checked_sub(BASE_ADDRESS)
        .map(usize::from)
        .filter(|start| start + usize::from(cnt) <= image.len());
    match start {
        Some(start) => {
            let values = image[start..start + usize::from(cnt)].to_vec();
            trace!(addr, cnt, ?values, "Register read");
            Ok(values)
        }
        None => {
            warn!(addr, cnt, "Read outside the register map");
            Err(ExceptionCode::IllegalDataAddress)
        }
    }
}

fn lock(tree: &Mutex<AttributeSet>) -> MutexGuard<'_, AttributeSet> {
    tree.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`DeviceBus`] exported as a SunSpec Modbus TCP server.
///
/// `register` binds the listener and spawns the server, so it must be called
/// from within a Tokio runtime. The attribute tree outlives registrations.
pub struct ModbusBus {
    listen: SocketAddr,
    bound: Option<SocketAddr>,
    tree: Arc<Mutex<AttributeSet>>,
    server: Option<JoinHandle<()>>,
    generation: u64,
}

impl ModbusBus {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            bound: None,
            tree: Arc::new(Mutex::new(AttributeSet::new())),
            server: None,
            generation: 0,
        }
    }

    /// Address of the last successful bind. Re-registration reuses it, so a
    /// configured port 0 keeps the port picked the first time.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound
    }

    /// Stops the server and waits until the listener is released.
    pub async fn detach(&mut self) {
        if let Some(server) = self.server.take() {
            server.abort();
            let _ = server.await;
            info!("Modbus server stopped");
        }
    }

    pub fn snapshot(&self) -> AttributeSet {
        lock(&self.tree).clone()
    }
}

impl DeviceBus for ModbusBus {
    fn register(&mut self, schema: &ServiceSchema) -> Result<BusHandle, BusError> {
        if let Some(server) = self.server.take() {
            server.abort();
        }

        let addr = self.bound.unwrap_or(self.listen);
        let bind_error = |source| BusError::Bind { addr, source };
        let listener = std::net::TcpListener::bind(addr).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        let listener = TcpListener::from_std(listener).map_err(bind_error)?;
        let local = listener.local_addr().map_err(bind_error)?;

        {
            let mut tree = lock(&self.tree);
            for (path, value) in &schema.paths {
                tree.entry(path.clone()).or_insert_with(|| value.clone());
            }
        }

        let registers = SunSpecRegisters {
            tree: self.tree.clone(),
        };
        self.server = Some(tokio::spawn(async move {
            if let Err(err) = serve_registers(listener, registers).await {
                error!("Modbus server exited: {err:#}");
            }
        }));
        self.bound = Some(local);
        self.generation += 1;

        info!(
            service = %schema.service_name,
            addr = %local,
            "Serving SunSpec registers"
        );
        Ok(BusHandle::new(&schema.service_name, self.generation))
    }

    fn publish(&mut self, handle: &BusHandle, values: &AttributeSet) -> Result<(), BusError> {
        if !self.is_attached(handle) {
            return Err(BusError::Detached(handle.service_name().to_string()));
        }
        lock(&self.tree).extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    fn is_attached(&self, handle: &BusHandle) -> bool {
        handle.generation() == self.generation
            && self
                .server
                .as_ref()
                .is_some_and(|server| !server.is_finished())
    }
}

impl Drop for ModbusBus {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

async fn serve_registers(listener: TcpListener, registers: SunSpecRegisters) -> anyhow::Result<()> {
    let server = Server::new(listener);
    let new_service = |_socket_addr| Ok(Some(registers.clone()));
    let on_connected = |stream, socket_addr| async move {
        accept_tcp_connection(stream, socket_addr, new_service)
    };
    let on_process_error = |err| {
        warn!("Modbus connection error: {err}");
    };
    server.serve(&on_connected, on_process_error).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{paths, AttributeValue};
    use crate::config::BridgeConfig;
    use crate::sunspec::{f32_from_registers, string_from_registers, SERIAL_NUMBER, WATTS};
    use tokio_modbus::server::Service;

    fn schema() -> ServiceSchema {
        let config = BridgeConfig::from_lookup(|key| match key {
            "SHELLY_HOST" => Some("shelly.local".to_string()),
            "PHASE" => Some("L2".to_string()),
            _ => None,
        })
        .unwrap();
        ServiceSchema::pv_inverter(&config)
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_register_read_bounds() {
        let image = sunspec::render(&AttributeSet::new());

        assert_eq!(register_read(&image, 40000, 2).unwrap(), vec![0x5375, 0x6e53]);
        assert_eq!(register_read(&image, 40131, 2).unwrap(), vec![0xFFFF, 0]);
        assert_eq!(
            register_read(&image, 39999, 2),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            register_read(&image, 40131, 3),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            register_read(&image, 40000, 0),
            Err(ExceptionCode::IllegalDataValue)
        );
    }

    #[tokio::test]
    async fn test_service_answers_reads_only() {
        let registers = SunSpecRegisters {
            tree: Arc::new(Mutex::new(schema().paths)),
        };

        let res = registers
            .call(Request::ReadInputRegisters(40002, 2))
            .await
            .unwrap();
        assert_eq!(res, Response::ReadInputRegisters(vec![1, 65]));

        let res = registers.call(Request::WriteSingleRegister(40091, 1)).await;
        assert_eq!(res, Err(ExceptionCode::IllegalFunction));
    }

    #[tokio::test]
    async fn test_publish_is_served_over_tcp() {
        let mut bus = ModbusBus::new(loopback());
        let handle = bus.register(&schema()).unwrap();
        assert!(bus.is_attached(&handle));
        let addr = bus.local_addr().unwrap();

        let values = AttributeSet::from([
            (paths::AC_POWER.to_string(), AttributeValue::Float(1200.0)),
            (paths::SERIAL.to_string(), "AABBCC".into()),
        ]);
        bus.publish(&handle, &values).unwrap();
        assert_eq!(bus.snapshot()[paths::AC_POWER], AttributeValue::Float(1200.0));
        assert_eq!(bus.snapshot()[paths::PHASE], AttributeValue::from("L2"));

        let mut ctx = tcp::connect(addr).await.unwrap();
        let watts = ctx.read_holding_registers(WATTS, 2).await.unwrap().unwrap();
        assert_eq!(f32_from_registers(watts[0], watts[1]), 1200.0);
        let serial = ctx
            .read_holding_registers(SERIAL_NUMBER, 16)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(string_from_registers(&serial), "AABBCC");
        let outside = ctx.read_holding_registers(50000, 2).await.unwrap();
        assert_eq!(outside, Err(ExceptionCode::IllegalDataAddress));

        bus.detach().await;
    }

    #[tokio::test]
    async fn test_detach_and_reregister_keeps_address_and_values() {
        let mut bus = ModbusBus::new(loopback());
        let first = bus.register(&schema()).unwrap();
        let addr = bus.local_addr().unwrap();
        let values = AttributeSet::from([(paths::AC_POWER.to_string(), 640.0.into())]);
        bus.publish(&first, &values).unwrap();

        bus.detach().await;
        assert!(!bus.is_attached(&first));
        assert!(matches!(
            bus.publish(&first, &values),
            Err(BusError::Detached(_))
        ));

        let second = bus.register(&schema()).unwrap();
        assert_eq!(second.generation(), first.generation() + 1);
        assert_eq!(bus.local_addr(), Some(addr));
        assert!(bus.is_attached(&second));
        assert!(!bus.is_attached(&first));
        assert_eq!(bus.snapshot()[paths::AC_POWER], AttributeValue::Float(640.0));

        bus.detach().await;
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let taken = std::net::TcpListener::bind(loopback()).unwrap();
        let addr = taken.local_addr().unwrap();

        let mut bus = ModbusBus::new(addr);
        let err = bus.register(&schema()).unwrap_err();
        assert!(matches!(err, BusError::Bind { addr: a, .. } if a == addr));
        assert_eq!(bus.local_addr(), None);
    }
}
