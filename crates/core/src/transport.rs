//! Virtual audio device endpoints.
//!
//! Streams never talk to firmware directly; they open named endpoints on a
//! [`VirtualTransport`] and move samples through ring buffers. The
//! [`LoopbackDevice`] is the deterministic in-memory implementation used by
//! the simulation and the tests.
//!
//! # Buffers
//!
//! Each endpoint owns a ring buffer of `size` device words with separate read
//! and write offsets. One word is always kept free, so a buffer of `size`
//! words holds at most `size - 1` samples. Opening an endpoint yields two
//! handles, one per offset, which is what [`crate::buffer::buffer_stats`]
//! needs to gauge readiness.
//!
//! # Routing
//!
//! An endpoint may forward everything inserted into it to another endpoint.
//! SCO links use this to loop the from-air side straight back to the to-air
//! side.

use crate::error::{ResourceError, Result};
use crate::Sample;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Device word width used by [`LoopbackDevice`] endpoints, in bits.
pub const DEVICE_WORD_WIDTH: u32 = 32;

/// Opaque handle to one side of an open endpoint.
pub type Handle = usize;

/// The pair of handles returned by [`VirtualTransport::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Port {
    /// Consumer side; its offset is the read offset
    pub read: Handle,
    /// Producer side; its offset is the write offset
    pub write: Handle,
}

/// Device access used by streams.
pub trait VirtualTransport {
    /// Open a named endpoint.
    ///
    /// # Errors
    /// `ResourceError::EndpointUnavailable` if the device has no such
    /// endpoint.
    fn open(&mut self, endpoint: &str) -> Result<Port>;

    /// Release both handles of a port.
    fn close(&mut self, port: Port) -> Result<()>;

    /// Capacity of the buffer behind `handle`, in device words.
    fn get_buffer_size(&self, handle: Handle) -> Result<usize>;

    /// Word width of the buffer behind `handle`, in bits.
    fn get_handle_sample_size(&self, handle: Handle) -> Result<u32>;

    /// Current offset of `handle` (read offset for a read handle, write
    /// offset for a write handle).
    fn get_handle_offset(&self, handle: Handle) -> Result<usize>;

    /// Write samples through a write handle.
    ///
    /// # Returns
    /// Number of samples accepted. Samples beyond the free space are dropped.
    fn insert(&mut self, handle: Handle, data: &[Sample]) -> Result<usize>;

    /// Read up to `count` samples through a read handle.
    fn extract(&mut self, handle: Handle, count: usize) -> Result<Vec<Sample>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Read,
    Write,
}

#[derive(Debug)]
struct Endpoint {
    name: String,
    width: u32,
    buf: Vec<Sample>,
    read: usize,
    write: usize,
    route: Option<usize>,
}

impl Endpoint {
    fn size(&self) -> usize {
        self.buf.len()
    }

    fn used(&self) -> usize {
        if self.write >= self.read {
            self.write - self.read
        } else {
            self.size() - (self.read - self.write)
        }
    }

    fn free(&self) -> usize {
        self.size().saturating_sub(self.used() + 1)
    }

    fn push(&mut self, data: &[Sample]) -> usize {
        let accepted = data.len().min(self.free());
        for &sample in &data[..accepted] {
            self.buf[self.write] = sample;
            self.write = (self.write + 1) % self.size();
        }
        accepted
    }

    fn pop(&mut self, count: usize) -> Vec<Sample> {
        let n = count.min(self.used());
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.buf[self.read]);
            self.read = (self.read + 1) % self.size();
        }
        out
    }
}

/// Deterministic in-memory device.
#[derive(Debug, Default)]
pub struct LoopbackDevice {
    endpoints: Vec<Endpoint>,
    handles: HashMap<Handle, (usize, Side)>,
    next_handle: Handle,
}

impl LoopbackDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an endpoint with a ring buffer of `size` words.
    pub fn with_endpoint(mut self, name: &str, size: usize) -> Self {
        self.add_endpoint(name, size);
        self
    }

    /// Forward samples inserted into `from` to `to`'s buffer.
    ///
    /// Unknown names are ignored.
    pub fn with_route(mut self, from: &str, to: &str) -> Self {
        self.add_route(from, to);
        self
    }

    pub fn add_endpoint(&mut self, name: &str, size: usize) {
        if self.find(name).is_some() {
            return;
        }
        self.endpoints.push(Endpoint {
            name: name.to_string(),
            width: DEVICE_WORD_WIDTH,
            buf: vec![0; size.max(2)],
            read: 0,
            write: 0,
            route: None,
        });
    }

    pub fn add_route(&mut self, from: &str, to: &str) {
        if let (Some(src), Some(dst)) = (self.find(from), self.find(to)) {
            self.endpoints[src].route = Some(dst);
        }
    }

    /// Add the two endpoints of a SCO link and loop from-air into to-air.
    pub fn add_sco_link(&mut self, service_tag: u32, size: usize) {
        let from_air = sco_from_air(service_tag);
        let to_air = sco_to_air(service_tag);
        self.add_endpoint(&from_air, size);
        self.add_endpoint(&to_air, size);
        self.add_route(&from_air, &to_air);
    }

    /// Builder form of [`LoopbackDevice::add_sco_link`].
    pub fn with_sco_link(mut self, service_tag: u32, size: usize) -> Self {
        self.add_sco_link(service_tag, size);
        self
    }

    /// Samples currently buffered in a named endpoint.
    pub fn buffered(&self, name: &str) -> Option<usize> {
        self.find(name).map(|i| self.endpoints[i].used())
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.endpoints.iter().position(|e| e.name == name)
    }

    fn lookup(&self, handle: Handle) -> Result<(usize, Side)> {
        self.handles
            .get(&handle)
            .copied()
            .ok_or_else(|| ResourceError::InvalidHandle(handle).into())
    }
}

/// Endpoint a SCO source writes into.
pub fn sco_from_air(service_tag: u32) -> String {
    format!("sco{}/from_air", service_tag)
}

/// Endpoint a SCO sink reads from.
pub fn sco_to_air(service_tag: u32) -> String {
    format!("sco{}/to_air", service_tag)
}

impl VirtualTransport for LoopbackDevice {
    fn open(&mut self, endpoint: &str) -> Result<Port> {
        let index = self
            .find(endpoint)
            .ok_or_else(|| ResourceError::EndpointUnavailable(endpoint.to_string()))?;

        let read = self.next_handle;
        let write = self.next_handle + 1;
        self.next_handle += 2;
        self.handles.insert(read, (index, Side::Read));
        self.handles.insert(write, (index, Side::Write));

        debug!(endpoint, read, write, "endpoint opened");
        Ok(Port { read, write })
    }

    fn close(&mut self, port: Port) -> Result<()> {
        self.lookup(port.read)?;
        self.lookup(port.write)?;
        self.handles.remove(&port.read);
        self.handles.remove(&port.write);
        Ok(())
    }

    fn get_buffer_size(&self, handle: Handle) -> Result<usize> {
        let (index, _) = self.lookup(handle)?;
        Ok(self.endpoints[index].size())
    }

    fn get_handle_sample_size(&self, handle: Handle) -> Result<u32> {
        let (index, _) = self.lookup(handle)?;
        Ok(self.endpoints[index].width)
    }

    fn get_handle_offset(&self, handle: Handle) -> Result<usize> {
        let (index, side) = self.lookup(handle)?;
        let endpoint = &self.endpoints[index];
        Ok(match side {
            Side::Read => endpoint.read,
            Side::Write => endpoint.write,
        })
    }

    fn insert(&mut self, handle: Handle, data: &[Sample]) -> Result<usize> {
        let (index, _) = self.lookup(handle)?;
        let target = self.endpoints[index].route.unwrap_or(index);
        let endpoint = &mut self.endpoints[target];

        let accepted = endpoint.push(data);
        if accepted < data.len() {
            warn!(
                endpoint = %endpoint.name,
                dropped = data.len() - accepted,
                "endpoint buffer full"
            );
        }
        Ok(accepted)
    }

    fn extract(&mut self, handle: Handle, count: usize) -> Result<Vec<Sample>> {
        let (index, _) = self.lookup(handle)?;
        Ok(self.endpoints[index].pop(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::buffer_stats;
    use crate::error::Error;

    #[test]
    fn test_open_unknown_endpoint() {
        let mut dev = LoopbackDevice::new();
        let err = dev.open("nowhere").unwrap_err();
        assert!(matches!(
            err,
            Error::Resource(ResourceError::EndpointUnavailable(ref name)) if name == "nowhere"
        ));
    }

    #[test]
    fn test_insert_extract_fifo() {
        let mut dev = LoopbackDevice::new().with_endpoint("ep", 8);
        let port = dev.open("ep").unwrap();

        assert_eq!(dev.insert(port.write, &[1, 2, 3]).unwrap(), 3);
        assert_eq!(dev.extract(port.read, 2).unwrap(), vec![1, 2]);
        assert_eq!(dev.extract(port.read, 5).unwrap(), vec![3]);
        assert!(dev.extract(port.read, 1).unwrap().is_empty());
    }

    #[test]
    fn test_full_buffer_keeps_one_slot() {
        let mut dev = LoopbackDevice::new().with_endpoint("ep", 4);
        let port = dev.open("ep").unwrap();
        assert_eq!(dev.insert(port.write, &[1, 2, 3, 4, 5]).unwrap(), 3);
    }

    #[test]
    fn test_offsets_feed_buffer_stats() {
        let mut dev = LoopbackDevice::new().with_endpoint("ep", 10);
        let port = dev.open("ep").unwrap();
        dev.insert(port.write, &[0; 7]).unwrap();
        dev.extract(port.read, 5).unwrap();
        dev.insert(port.write, &[0; 6]).unwrap(); // wraps

        let r = dev.get_handle_offset(port.read).unwrap();
        let w = dev.get_handle_offset(port.write).unwrap();
        let size = dev.get_buffer_size(port.read).unwrap();
        let width = dev.get_handle_sample_size(port.read).unwrap();
        assert_eq!((r, w), (5, 3));

        let stats = buffer_stats(r, w, size, width);
        assert_eq!(stats.used, 8);
        assert_eq!(stats.free, 1);
    }

    #[test]
    fn test_sco_link_route() {
        let mut dev = LoopbackDevice::new().with_sco_link(100, 64);
        let source = dev.open(&sco_from_air(100)).unwrap();
        let sink = dev.open(&sco_to_air(100)).unwrap();

        dev.insert(source.write, &[9, 8, 7]).unwrap();
        assert_eq!(dev.buffered(&sco_from_air(100)), Some(0));
        assert_eq!(dev.extract(sink.read, 3).unwrap(), vec![9, 8, 7]);
    }

    #[test]
    fn test_closed_handle_is_invalid() {
        let mut dev = LoopbackDevice::new().with_endpoint("ep", 4);
        let port = dev.open("ep").unwrap();
        dev.close(port).unwrap();
        assert!(dev.get_buffer_size(port.read).is_err());
    }
}
