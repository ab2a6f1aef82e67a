//! Radio control: push-to-talk and dial frequency.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::config::{PttMethod, RigConfig};
use crate::error::{ModemError, Result};

pub trait RigControl: Send {
    fn name(&self) -> &str;

    fn set_ptt(&mut self, transmit: bool) -> Result<()>;

    fn set_frequency(&mut self, hz: u64) -> Result<()>;
}

/// Build the rig described by the configuration and tune it if a frequency
/// is set.
pub fn from_config(config: &RigConfig) -> Result<Box<dyn RigControl>> {
    let mut rig: Box<dyn RigControl> = match config.ptt {
        PttMethod::Vox => Box::new(VoxRig::new()),
        PttMethod::Rigctld => Box::new(RigctldClient::connect(
            &config.rigctld_address,
            Duration::from_millis(config.timeout_ms),
        )?),
    };
    if let Some(hz) = config.frequency_hz {
        rig.set_frequency(hz)?;
    }
    Ok(rig)
}

/// The radio keys itself when it hears audio. Only remembers the PTT state.
#[derive(Debug, Default)]
pub struct VoxRig {
    keyed: bool,
}

impl VoxRig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_keyed(&self) -> bool {
        self.keyed
    }
}

impl RigControl for VoxRig {
    fn name(&self) -> &str {
        "vox"
    }

    fn set_ptt(&mut self, transmit: bool) -> Result<()> {
        self.keyed = transmit;
        Ok(())
    }

    fn set_frequency(&mut self, hz: u64) -> Result<()> {
        log::debug!("vox rig cannot tune; ignoring {} Hz", hz);
        Ok(())
    }
}

/// Client for hamlib's `rigctld` network daemon.
pub struct RigctldClient {
    address: SocketAddr,
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

impl RigctldClient {
    pub fn connect(address: &str, timeout: Duration) -> Result<Self> {
        let address = address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ModemError::Rig(format!("cannot resolve {}", address)))?;
        let stream = TcpStream::connect_timeout(&address, timeout)
            .map_err(|e| ModemError::Rig(format!("connect {}: {}", address, e)))?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true).ok();
        let reader = BufReader::new(stream.try_clone()?);
        log::info!("connected to rigctld at {}", address);
        Ok(Self {
            address,
            writer: stream,
            reader,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Send one command and wait for its `RPRT` status line.
    fn command(&mut self, line: &str) -> Result<()> {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .map_err(|e| ModemError::Rig(format!("write '{}': {}", line, e)))?;
        self.writer.flush()?;

        let mut reply = String::new();
        loop {
            reply.clear();
            let n = self
                .reader
                .read_line(&mut reply)
                .map_err(|e| ModemError::Rig(format!("read reply to '{}': {}", line, e)))?;
            if n == 0 {
                return Err(ModemError::Rig("rigctld closed the connection".to_string()));
            }
            if let Some(code) = reply.trim().strip_prefix("RPRT") {
                let code: i32 = code
                    .trim()
                    .parse()
                    .map_err(|_| ModemError::Rig(format!("bad reply '{}'", reply.trim())))?;
                if code != 0 {
                    return Err(ModemError::Rig(format!("'{}' failed with RPRT {}", line, code)));
                }
                return Ok(());
            }
        }
    }
}

impl RigControl for RigctldClient {
    fn name(&self) -> &str {
        "rigctld"
    }

    fn set_ptt(&mut self, transmit: bool) -> Result<()> {
        self.command(if transmit { "T 1" } else { "T 0" })
    }

    fn set_frequency(&mut self, hz: u64) -> Result<()> {
        self.command(&format!("F {}", hz))
    }
}

impl Drop for RigctldClient {
    fn drop(&mut self) {
        let _ = self.set_ptt(false);
    }
}
