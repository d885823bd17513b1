use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

const BUFFER_SIZE: usize = 64 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum CopyError {
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

/// A process-wide free-list of 64 KiB buffers shared by every `copy_bidirectional` call.
#[derive(Clone, Default)]
pub struct BufferPool(Arc<Mutex<Vec<BytesMut>>>);

impl BufferPool {
	pub fn new() -> Self {
		Self::default()
	}

	fn checkout(&self) -> BytesMut {
		match self.0.lock().unwrap().pop() {
			Some(mut buf) => {
				buf.clear();
				buf.reserve(BUFFER_SIZE);
				buf
			},
			None => BytesMut::with_capacity(BUFFER_SIZE),
		}
	}

	fn checkin(&self, buf: BytesMut) {
		let mut pool = self.0.lock().unwrap();
		if pool.len() < 256 {
			pool.push(buf);
		}
	}
}

/// Pumps bytes in both directions between `a` and `b` until either side hits EOF or a read/write
/// error occurs. The first non-EOF error on either leg terminates the whole transfer; a clean EOF
/// on one side alone (with the peer still readable) is treated as success for that direction.
pub async fn copy_bidirectional<A, B>(
	pool: &BufferPool,
	a: A,
	b: B,
) -> Result<(u64, u64), CopyError>
where
	A: AsyncRead + AsyncWrite + Unpin,
	B: AsyncRead + AsyncWrite + Unpin,
{
	let (mut a_read, mut a_write) = tokio::io::split(a);
	let (mut b_read, mut b_write) = tokio::io::split(b);

	let a_to_b = pump(pool.clone(), &mut a_read, &mut b_write);
	let b_to_a = pump(pool.clone(), &mut b_read, &mut a_write);

	let (sent, received) = tokio::try_join!(a_to_b, b_to_a)?;
	let _ = a_write.shutdown().await;
	let _ = b_write.shutdown().await;
	Ok((sent, received))
}

async fn pump<R, W>(pool: BufferPool, r: &mut R, w: &mut W) -> Result<u64, CopyError>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut buf = pool.checkout();
	let mut total = 0u64;
	loop {
		buf.clear();
		buf.resize(BUFFER_SIZE, 0);
		let n = r.read(&mut buf).await?;
		if n == 0 {
			trace!(total, "copy direction reached EOF");
			break;
		}
		w.write_all(&buf[..n]).await?;
		total += n as u64;
	}
	pool.checkin(buf);
	Ok(total)
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::duplex;

	#[tokio::test]
	async fn copies_both_directions_until_eof() {
		// client_a <-> pump_a  ... copy_bidirectional(pump_a, pump_b) ...  pump_b <-> client_b
		let (client_a, pump_a) = duplex(1024);
		let (client_b, pump_b) = duplex(1024);
		let pool = BufferPool::new();

		let copier = tokio::spawn(async move { copy_bidirectional(&pool, pump_a, pump_b).await });

		let (mut client_a, mut client_b) = (client_a, client_b);
		client_a.write_all(b"hello").await.unwrap();
		let mut out = [0u8; 5];
		client_b.read_exact(&mut out).await.unwrap();
		assert_eq!(&out, b"hello");

		client_b.write_all(b"world").await.unwrap();
		let mut out2 = [0u8; 5];
		client_a.read_exact(&mut out2).await.unwrap();
		assert_eq!(&out2, b"world");

		drop(client_a);
		drop(client_b);
		let (sent, received) = copier.await.unwrap().unwrap();
		assert_eq!(sent, 5);
		assert_eq!(received, 5);
	}
}
