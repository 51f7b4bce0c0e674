//! The application layer. Payloads handed up by the transport are treated as
//! text, logged, and kept for inspection.

use std::sync::Mutex;

/// A datagram payload delivered to the application.
///
/// The transport supplies an exact byte length, while the original text
/// convention ends at the first NUL; both views are kept available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    bytes: Vec<u8>,
}

impl Delivery {
    /// The full payload as received.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The number of bytes received.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The length of the message text: the bytes before the first NUL, or
    /// the whole payload if none is present.
    pub fn text_len(&self) -> usize {
        self.bytes
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(self.bytes.len())
    }

    /// The message text, lossily decoded.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes[..self.text_len()]).into_owned()
    }
}

/// Receives payloads at the top of the stack and stores them so callers can
/// observe what arrived.
#[derive(Debug, Default)]
pub struct Application {
    received: Mutex<Vec<Delivery>>,
}

impl Application {
    /// Creates a new application endpoint with no deliveries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts a payload from the transport layer.
    pub fn deliver(&self, payload: Vec<u8>) {
        let delivery = Delivery { bytes: payload };
        tracing::info!(
            text_len = delivery.text_len(),
            received = delivery.len(),
            "received message: {}",
            delivery.text()
        );
        self.received.lock().unwrap().push(delivery);
    }

    /// The deliveries received so far, oldest first.
    pub fn received(&self) -> Vec<Delivery> {
        self.received.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_deliveries_in_order() {
        let application = Application::new();
        application.deliver(b"first".to_vec());
        application.deliver(b"second".to_vec());
        let received = application.received();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].text(), "first");
        assert_eq!(received[1].text(), "second");
    }

    #[test]
    fn text_stops_at_the_first_nul() {
        let application = Application::new();
        application.deliver(b"cut\0here".to_vec());
        let received = application.received();
        assert_eq!(received[0].text_len(), 3);
        assert_eq!(received[0].text(), "cut");
        // The received length stays available alongside the text view.
        assert_eq!(received[0].len(), 8);
    }

    #[test]
    fn empty_delivery_is_kept() {
        let application = Application::new();
        application.deliver(Vec::new());
        let received = application.received();
        assert_eq!(received.len(), 1);
        assert!(received[0].is_empty());
        assert_eq!(received[0].text(), "");
    }
}
