//! TCP transport: dial plus buffered line reader and writer halves.

use std::time::Duration;

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::{Error, Result};
use crate::message::{DELIMITER, MAX_LINE_LENGTH, Message, ParseError};

/// Open a TCP connection to `server` (host:port) and split it into line halves.
///
/// Dropping both halves closes the socket.
pub async fn dial(
    server: &str,
    timeout: Duration,
) -> Result<(LineReader<BufReader<OwnedReadHalf>>, LineWriter<BufWriter<OwnedWriteHalf>>)> {
    tracing::debug!("Resolving {server}...");
    let tcp = match tokio::time::timeout(timeout, TcpStream::connect(server)).await {
        Ok(Ok(tcp)) => tcp,
        Ok(Err(source)) => {
            return Err(Error::Dial {
                server: server.to_string(),
                source,
            });
        }
        Err(_) => {
            return Err(Error::DialTimeout {
                server: server.to_string(),
            });
        }
    };
    tcp.set_nodelay(true)?;
    tracing::debug!("TCP connected to {server}");

    let (reader, writer) = tcp.into_split();
    Ok((
        LineReader::new(BufReader::new(reader)),
        LineWriter::new(BufWriter::new(writer)),
    ))
}

/// Reads `\n`-delimited lines.
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(512),
        }
    }

    /// Read one line with the delimiter and any `\r` removed.
    ///
    /// End of stream is [`Error::Eof`]. Invalid UTF-8 is replaced rather
    /// than rejected, since plenty of servers still relay latin-1 text.
    /// At most `MAX_LINE_LENGTH` plus CRLF bytes are buffered; a longer
    /// line is [`ParseError::LineTooLong`] as soon as the limit is hit.
    pub async fn read_line(&mut self) -> Result<String> {
        self.buf.clear();
        let limit = (MAX_LINE_LENGTH + 2) as u64;
        let n = (&mut self.inner)
            .take(limit)
            .read_until(DELIMITER, &mut self.buf)
            .await?;
        if n == 0 {
            return Err(Error::Eof);
        }
        if n as u64 >= limit && self.buf.last() != Some(&DELIMITER) {
            return Err(ParseError::LineTooLong(n).into());
        }
        let line = String::from_utf8_lossy(&self.buf);
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Read and decode one message.
    pub async fn read_message(&mut self) -> Result<Message> {
        let line = self.read_line().await?;
        Ok(Message::parse(&line)?)
    }
}

/// Writes serialized messages, flushing after each one.
pub struct LineWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_message(&mut self, msg: &Message) -> Result<()> {
        self.inner.write_all(msg.to_wire().as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_lines_without_terminators() {
        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(b"PING :a\r\nPING :b\nNOTICE * :c")
            .await
            .unwrap();
        drop(client);

        let mut reader = LineReader::new(BufReader::new(server));
        assert_eq!(reader.read_line().await.unwrap(), "PING :a");
        assert_eq!(reader.read_line().await.unwrap(), "PING :b");
        // Unterminated final line is still delivered before EOF.
        assert_eq!(reader.read_line().await.unwrap(), "NOTICE * :c");
        assert!(matches!(reader.read_line().await, Err(Error::Eof)));
    }

    #[tokio::test]
    async fn malformed_line_is_an_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b":prefixonly\r\n").await.unwrap();

        let mut reader = LineReader::new(BufReader::new(server));
        assert!(matches!(
            reader.read_message().await,
            Err(Error::Malformed(ParseError::MissingCommand))
        ));
    }

    #[tokio::test]
    async fn unterminated_flood_is_cut_off_at_the_line_limit() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        client
            .write_all(&vec![b'x'; MAX_LINE_LENGTH + 1024])
            .await
            .unwrap();
        // The peer stays open and never sends a newline.

        let mut reader = LineReader::new(BufReader::new(server));
        let result = tokio::time::timeout(Duration::from_secs(2), reader.read_line())
            .await
            .expect("reader waited for a newline past the limit");
        assert!(matches!(
            result,
            Err(Error::Malformed(ParseError::LineTooLong(n))) if n == MAX_LINE_LENGTH + 2
        ));
        drop(client);
    }

    #[tokio::test]
    async fn line_at_the_limit_is_accepted() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let mut line = vec![b'x'; MAX_LINE_LENGTH];
        line.extend_from_slice(b"\r\n");
        client.write_all(&line).await.unwrap();

        let mut reader = LineReader::new(BufReader::new(server));
        assert_eq!(reader.read_line().await.unwrap().len(), MAX_LINE_LENGTH);
    }

    #[tokio::test]
    async fn writer_terminates_lines() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = LineWriter::new(client);
        writer.write_message(&Message::nick("bot")).await.unwrap();
        writer
            .write_message(&Message::privmsg("#c", "hi there"))
            .await
            .unwrap();
        drop(writer);

        let mut reader = LineReader::new(BufReader::new(server));
        assert_eq!(reader.read_line().await.unwrap(), "NICK :bot");
        assert_eq!(reader.read_line().await.unwrap(), "PRIVMSG #c :hi there");
        assert!(matches!(reader.read_line().await, Err(Error::Eof)));
    }

    #[tokio::test]
    async fn dial_refused_is_a_dial_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = dial(&addr, Duration::from_secs(5)).await.err().unwrap();
        assert!(
            matches!(err, Error::Dial { .. } | Error::DialTimeout { .. }),
            "unexpected error: {err}"
        );
    }
}
