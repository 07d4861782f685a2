use std::io::{self, Write};

/// Writer adaptor that starts every line with a fixed tag.
///
/// The prefix goes in front of the first byte of a write unless the
/// previous write stopped mid-line, and after every `\n` that is not the
/// last byte of the payload. A trailing newline therefore leaves the next
/// prefix pending until more output arrives, which keeps the tag off a
/// line that may never be written.
#[derive(Debug)]
pub struct LogPrefixer<W: Write> {
    inner: W,
    prefix: Vec<u8>,
    midline: bool,
}

impl<W: Write> LogPrefixer<W> {
    pub fn new(inner: W, prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
            midline: false,
        }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn transform(&self, buf: &[u8]) -> Vec<u8> {
        let lines = buf.iter().filter(|&&b| b == b'\n').count();
        let mut out = Vec::with_capacity(buf.len() + (lines + 1) * self.prefix.len());
        if !self.midline {
            out.extend_from_slice(&self.prefix);
        }
        let last = buf.len() - 1;
        for (i, &b) in buf.iter().enumerate() {
            out.push(b);
            if b == b'\n' && i != last {
                out.extend_from_slice(&self.prefix);
            }
        }
        out
    }
}

impl<W: Write> Write for LogPrefixer<W> {
    /// Reports the input length on success; prefix bytes are never counted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let out = self.transform(buf);
        self.inner.write_all(&out)?;
        self.midline = buf[buf.len() - 1] != b'\n';
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
