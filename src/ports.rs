use std::net::TcpListener;

use crate::error::LabError;

/// Ephemeral port assignment, injectable so tests can script it.
pub trait PortAllocator: Send + Sync {
    fn find_random_port(&self) -> Result<u16, LabError>;
}

/// Asks the kernel: bind port 0 on loopback, read back the assignment,
/// release the socket. The window between release and the hypervisor's
/// own bind is fundamentally racy, so the result is a strong hint, not
/// a reservation.
pub struct KernelPortAllocator;

impl PortAllocator for KernelPortAllocator {
    fn find_random_port(&self) -> Result<u16, LabError> {
        let listener = TcpListener::bind("127.0.0.1:0").map_err(|source| LabError::Io {
            context: "binding ephemeral port on loopback".into(),
            source,
        })?;
        let port = listener
            .local_addr()
            .map_err(|source| LabError::Io {
                context: "reading back ephemeral port".into(),
                source,
            })?
            .port();
        drop(listener);
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_bindable_ports() {
        let alloc = KernelPortAllocator;
        let a = alloc.find_random_port().unwrap();
        let b = alloc.find_random_port().unwrap();
        assert!(a >= 1);
        assert!(b >= 1);

        // Each port is immediately re-bindable and connectable.
        for port in [a, b] {
            let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
            let stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
            drop(stream);
            drop(listener);
        }
    }
}
