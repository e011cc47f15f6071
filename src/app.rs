//! # Application context
//!
//! Explicit construction and teardown of the device-link services. The
//! transport is selected exactly once, here; everything else shares it
//! through the session manager.

use crate::config::IdeSettings;
use iotide_assistant::HttpAssistant;
use iotide_serial::serial::{
    select_transport, BackendKind, ConnectionInfo, LastDeviceStore, MonitorLog, ReplClient,
    SerialError, SerialSessionManager, SerialTransport,
};
use std::sync::Arc;

pub struct IdeContext {
    settings: IdeSettings,
    session: SerialSessionManager,
    repl: ReplClient,
    monitor: MonitorLog,
    assistant: Option<HttpAssistant>,
}

impl IdeContext {
    /// Select the backend named by `settings` and build the services on it.
    /// Must run inside a Tokio runtime.
    pub fn build(settings: IdeSettings) -> Result<Self, SerialError> {
        let transport = select_transport(settings.backend, settings.bridge_path.as_deref())?;
        Ok(Self::with_transport(settings, transport))
    }

    /// Build on an already constructed transport.
    pub fn with_transport(settings: IdeSettings, transport: Arc<dyn SerialTransport>) -> Self {
        let store = match settings.data_dir {
            Some(ref dir) => LastDeviceStore::in_dir(dir),
            None => LastDeviceStore::default_location(),
        };
        let session = SerialSessionManager::new(transport, store);
        let repl = ReplClient::with_options(session.clone(), settings.line_ending, settings.repl_timings());

        let monitor = MonitorLog::new(settings.monitor_capacity);
        monitor.attach(&session);

        let assistant = settings
            .assistant_endpoint
            .as_ref()
            .map(|endpoint| HttpAssistant::new(endpoint.clone(), settings.assistant_api_key.clone()));

        log::info!("IDE context ready ({} backend)", session.backend().label());
        Self { settings, session, repl, monitor, assistant }
    }

    pub fn settings(&self) -> &IdeSettings {
        &self.settings
    }

    pub fn session(&self) -> &SerialSessionManager {
        &self.session
    }

    pub fn repl(&self) -> &ReplClient {
        &self.repl
    }

    pub fn monitor(&self) -> &MonitorLog {
        &self.monitor
    }

    pub fn assistant(&self) -> Option<&HttpAssistant> {
        self.assistant.as_ref()
    }

    pub fn backend(&self) -> BackendKind {
        self.session.backend()
    }

    /// Auto-connect at the configured baud rate.
    pub async fn auto_connect(&self) -> Result<ConnectionInfo, SerialError> {
        self.session.connect(None, self.settings.baud_rate).await
    }

    /// Connect to a port by path, looking up its enumerated descriptor so
    /// manufacturer details reach the last-device record.
    pub async fn connect_path(&self, path: &str, baud_rate: Option<u32>) -> Result<ConnectionInfo, SerialError> {
        let port = self
            .session
            .discovery()
            .list_ports()
            .await
            .into_iter()
            .find(|p| p.path == path)
            .unwrap_or_else(|| iotide_serial::serial::PortDescriptor::from_path(path));
        self.session
            .connect(Some(port), baud_rate.unwrap_or(self.settings.baud_rate))
            .await
    }

    /// Send a raw line to the device and record it in the monitor.
    pub async fn send_line(&self, line: &str) -> Result<(), SerialError> {
        let mut bytes = line.as_bytes().to_vec();
        bytes.extend_from_slice(self.settings.line_ending.bytes());
        self.session.send(&bytes).await?;
        self.monitor.record_tx(line);
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.session.shutdown().await;
        log::info!("IDE context shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iotide_serial::serial::{SessionState, SimulatedTransport};

    fn context(dir: &std::path::Path) -> (IdeContext, Arc<SimulatedTransport>) {
        let sim = SimulatedTransport::new();
        sim.set_responder(SimulatedTransport::echo_repl());
        let settings = IdeSettings { data_dir: Some(dir.to_path_buf()), ..IdeSettings::default() };
        (IdeContext::with_transport(settings, sim.clone()), sim)
    }

    #[tokio::test]
    async fn test_auto_connect_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _sim) = context(dir.path());
        assert_eq!(ctx.backend(), BackendKind::Simulated);

        let info = ctx.auto_connect().await.unwrap();
        assert_eq!(info.port.path, "/dev/ttySIM0");
        assert_eq!(info.baud_rate, 115_200);
        assert!(dir.path().join("iot-ide-last-device.json").exists());

        ctx.shutdown().await;
        assert_eq!(ctx.session().state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_line_appends_terminator_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, sim) = context(dir.path());
        ctx.connect_path("/dev/ttySIM0", Some(9600)).await.unwrap();
        assert_eq!(sim.opened_config().unwrap().baud_rate, 9600);

        ctx.send_line("print(1)").await.unwrap();
        assert_eq!(sim.written().last().unwrap(), b"print(1)\n");
        assert!(ctx.monitor().entries().iter().any(|e| e.text == "print(1)"));
        ctx.shutdown().await;
    }

    #[test]
    fn test_assistant_only_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _enter = rt.enter();
        let (ctx, _) = context(dir.path());
        assert!(ctx.assistant().is_none());

        let settings = IdeSettings {
            data_dir: Some(dir.path().to_path_buf()),
            assistant_endpoint: Some("http://127.0.0.1:9/chat".into()),
            ..IdeSettings::default()
        };
        let ctx = IdeContext::with_transport(settings, SimulatedTransport::new());
        assert_eq!(ctx.assistant().unwrap().endpoint(), "http://127.0.0.1:9/chat");
    }
}
