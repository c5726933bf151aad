//! The unit passed between the reactor and the processor.

/// One in-flight message: its text, the nickname it came from, and the
/// nicknames it is going to. The reactor creates envelopes with no
/// destinations; the processor fills them in on the response it builds.
#[derive(Debug, Clone)]
pub struct Envelope {
    body: String,
    src: String,
    dsts: Vec<String>,
}

impl Envelope {
    pub fn new(body: impl Into<String>, src: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            src: src.into(),
            dsts: Vec::new(),
        }
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn source(&self) -> &str {
        &self.src
    }

    pub fn destinations(&self) -> &[String] {
        &self.dsts
    }

    pub fn add_destination(&mut self, dst: impl Into<String>) {
        self.dsts.push(dst.into());
    }
}
