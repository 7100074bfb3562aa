use std::io::{Error, ErrorKind, Read, Result, Seek, SeekFrom, Write};

use bincode::{
	config::{Configuration, Fixint, LittleEndian, NoLimit},
	Decode, Encode,
};

/// SOFS13 is little-endian with fixed-width integers throughout.
const CONFIG: Configuration<LittleEndian, Fixint, NoLimit> = bincode::config::standard()
	.with_fixed_int_encoding()
	.with_little_endian();

/// Structure codec over a seekable byte stream.
pub struct Codec<T> {
	inner: T,
}

impl<T> Codec<T> {
	pub fn new(inner: T) -> Self {
		Self {
			inner,
		}
	}

	pub fn inner(&self) -> &T {
		&self.inner
	}

	pub fn inner_mut(&mut self) -> &mut T {
		&mut self.inner
	}

	pub fn into_inner(self) -> T {
		self.inner
	}
}

impl<T: Read> Codec<T> {
	pub fn decode<X: Decode>(&mut self) -> Result<X> {
		bincode::decode_from_std_read(&mut self.inner, CONFIG)
			.map_err(|e| Error::new(ErrorKind::InvalidData, format!("failed to decode: {e}")))
	}

	pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
		self.inner.read_exact(buf)
	}
}

impl<T: Write> Codec<T> {
	pub fn encode<X: Encode>(&mut self, x: &X) -> Result<()> {
		bincode::encode_into_std_write(x, &mut self.inner, CONFIG)
			.map_err(|e| Error::new(ErrorKind::InvalidData, format!("failed to encode: {e}")))?;
		Ok(())
	}

	pub fn write(&mut self, buf: &[u8]) -> Result<()> {
		self.inner.write_all(buf)
	}
}

impl<T: Seek> Codec<T> {
	pub fn seek(&mut self, pos: u64) -> Result<()> {
		self.inner.seek(SeekFrom::Start(pos))?;
		Ok(())
	}
}

impl<T: Read + Seek> Codec<T> {
	pub fn decode_at<X: Decode>(&mut self, pos: u64) -> Result<X> {
		self.seek(pos)?;
		self.decode()
	}

	pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
		self.seek(pos)?;
		self.read(buf)
	}
}

impl<T: Write + Seek> Codec<T> {
	pub fn encode_at<X: Encode>(&mut self, pos: u64, x: &X) -> Result<()> {
		self.seek(pos)?;
		self.encode(x)
	}

	pub fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
		self.seek(pos)?;
		self.write(buf)
	}
}
