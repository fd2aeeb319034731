use super::error::MonitorError;
use super::types::MonitoredUrl;

/// Cycles through the monitored pages. Owned by the controller; never shared.
#[derive(Debug, Clone)]
pub struct UrlRotator {
    pages: Vec<MonitoredUrl>,
    cursor: usize,
}

impl UrlRotator {
    pub fn new(pages: Vec<MonitoredUrl>) -> Result<Self, MonitorError> {
        if pages.is_empty() {
            return Err(MonitorError::EmptyUrlSet);
        }
        Ok(Self { pages, cursor: 0 })
    }

    pub fn current(&self) -> &MonitoredUrl {
        &self.pages[self.cursor]
    }

    pub fn advance(&mut self) -> &MonitoredUrl {
        self.cursor = (self.cursor + 1) % self.pages.len();
        self.current()
    }

    #[cfg(test)]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }
}
