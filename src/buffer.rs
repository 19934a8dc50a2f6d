use std::io;
use std::os::fd::RawFd;
use std::string::FromUtf8Error;

/// Growable byte buffer with separate read and write cursors.
///
/// The backing storage is divided into three adjacent regions:
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// +-------------------+------------------+------------------+
/// 0      <=      reader_index   <=  writer_index    <=    len
/// ```
///
/// A small prepend reserve sits at the front so a length or type prefix can
/// be added later without moving the content. Once all readable content has
/// been retrieved, both cursors reset to the reserve offset.
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

/// Stack buffer size for the overflow half of the scatter read.
const EXTRA_BUF_SIZE: usize = 65536;

impl Buffer {
    /// Reserved prefix in front of the readable region.
    pub const CHEAP_PREPEND: usize = 8;
    /// Default initial size of the writable region.
    pub const INITIAL_SIZE: usize = 1024;

    /// Creates a buffer with the default initial size.
    pub fn new() -> Buffer {
        Buffer::with_capacity(Buffer::INITIAL_SIZE)
    }

    /// Creates a buffer whose writable region starts at `initial_size` bytes.
    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            buf: vec![0; Buffer::CHEAP_PREPEND + initial_size],
            reader_index: Buffer::CHEAP_PREPEND,
            writer_index: Buffer::CHEAP_PREPEND,
        }
    }

    /// Number of bytes available for reading.
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    /// Number of bytes that can be appended without growing.
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    /// Number of bytes in front of the readable region.
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// The readable content, without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Consumes up to `len` readable bytes; consuming everything resets the
    /// cursors to the prepend reserve.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Consumes all readable bytes.
    pub fn retrieve_all(&mut self) {
        self.reader_index = Buffer::CHEAP_PREPEND;
        self.writer_index = Buffer::CHEAP_PREPEND;
    }

    /// Copies out `len` readable bytes unchanged, then consumes them.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds [`readable_bytes`](Buffer::readable_bytes).
    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes(), "retrieving {} bytes out of range", len);
        let result = self.buf[self.reader_index..self.reader_index + len].to_vec();
        self.retrieve(len);
        result
    }

    /// Copies out all readable bytes unchanged, then consumes them.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        self.retrieve_as_bytes(self.readable_bytes())
    }

    /// Copies out `len` readable bytes as UTF-8, then consumes them. The
    /// bytes are consumed either way; a decode failure hands them back
    /// through [`FromUtf8Error::into_bytes`].
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds [`readable_bytes`](Buffer::readable_bytes).
    pub fn retrieve_as_string(&mut self, len: usize) -> Result<String, FromUtf8Error> {
        String::from_utf8(self.retrieve_as_bytes(len))
    }

    /// Copies out all readable bytes as UTF-8, then consumes them.
    pub fn retrieve_all_as_string(&mut self) -> Result<String, FromUtf8Error> {
        self.retrieve_as_string(self.readable_bytes())
    }

    /// Appends `data` behind the readable content, growing if needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        self.buf[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    /// Either grows the backing store or slides the readable content down to
    /// the prepend reserve, whichever frees enough room.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() - Buffer::CHEAP_PREPEND < len {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, Buffer::CHEAP_PREPEND);
            self.reader_index = Buffer::CHEAP_PREPEND;
            self.writer_index = self.reader_index + readable;
        }
    }

    /// Scatter-reads from `fd` into the writable region plus a 64 KiB stack
    /// overflow region, so a single call never short-reads while the buffer
    /// itself stays small in the common case.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra_buf = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();
        let mut iovs = [
            libc::iovec {
                iov_base: self.buf[self.writer_index..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra_buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra_buf.len(),
            },
        ];
        let iov_count = if writable < extra_buf.len() { 2 } else { 1 };
        let n = syscall!(readv(fd, iovs.as_mut_ptr(), iov_count))? as usize;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extra_buf[..n - writable]);
        }
        Ok(n)
    }

    /// Writes up to `readable_bytes` to `fd`. The cursor is not advanced;
    /// the caller retrieves however much was actually written.
    pub fn write_to_fd(&self, fd: RawFd) -> io::Result<usize> {
        let readable = self.peek();
        let n = syscall!(write(
            fd,
            readable.as_ptr() as *const libc::c_void,
            readable.len(),
        ))?;
        Ok(n as usize)
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("readable", &self.readable_bytes())
            .field("writable", &self.writable_bytes())
            .field("prependable", &self.prependable_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn assert_invariants(buffer: &Buffer) {
        assert!(Buffer::CHEAP_PREPEND <= buffer.reader_index);
        assert!(buffer.reader_index <= buffer.writer_index);
        assert!(buffer.writer_index <= buffer.buf.len());
    }

    #[test]
    fn round_trip() {
        let mut buffer = Buffer::new();
        buffer.append(b"hello, eventide");
        assert_eq!(buffer.readable_bytes(), 15);
        assert_eq!(buffer.retrieve_as_string(15).unwrap(), "hello, eventide");
        assert_eq!(buffer.readable_bytes(), 0);
        assert_eq!(buffer.prependable_bytes(), Buffer::CHEAP_PREPEND);
        assert_invariants(&buffer);
    }

    #[test]
    fn binary_round_trip_preserves_bytes() {
        let data = [0xff, 0xfe, 0x00, 0x80, 0xc3, 0x28, 0x01];
        let mut buffer = Buffer::new();
        buffer.append(&data);
        assert_eq!(buffer.retrieve_all_as_bytes(), data);
        assert_eq!(buffer.readable_bytes(), 0);
        assert_eq!(buffer.prependable_bytes(), Buffer::CHEAP_PREPEND);
        assert_invariants(&buffer);
    }

    #[test]
    fn invalid_utf8_surfaces_as_error_with_the_bytes() {
        let mut buffer = Buffer::new();
        buffer.append(&[0xff, 0xfe]);
        let err = buffer.retrieve_all_as_string().unwrap_err();
        assert_eq!(err.into_bytes(), vec![0xff, 0xfe]);
        // Consumed either way, like any other retrieve.
        assert_eq!(buffer.readable_bytes(), 0);
    }

    #[test]
    fn partial_retrieve() {
        let mut buffer = Buffer::new();
        buffer.append(b"abcdef");
        buffer.retrieve(2);
        assert_eq!(buffer.peek(), b"cdef");
        assert_eq!(buffer.prependable_bytes(), Buffer::CHEAP_PREPEND + 2);
        buffer.retrieve(4);
        assert_eq!(buffer.readable_bytes(), 0);
        assert_eq!(buffer.prependable_bytes(), Buffer::CHEAP_PREPEND);
    }

    #[test]
    fn retrieve_clamps_to_readable() {
        let mut buffer = Buffer::new();
        buffer.append(b"xyz");
        buffer.retrieve(100);
        assert_eq!(buffer.readable_bytes(), 0);
        assert_invariants(&buffer);
    }

    #[test]
    fn grows_on_large_append() {
        let mut buffer = Buffer::new();
        let before = buffer.buf.len();
        let data = vec![0x5a; Buffer::INITIAL_SIZE * 2];
        buffer.append(&data);
        assert!(buffer.buf.len() > before);
        assert_eq!(buffer.peek(), &data[..]);
        assert_invariants(&buffer);
    }

    #[test]
    fn make_space_slides_content_down() {
        let mut buffer = Buffer::new();
        buffer.append(&vec![1u8; 1000]);
        buffer.retrieve(800);
        let capacity_before = buffer.buf.len();
        // 900 doesn't fit behind the writer, but fits once the remaining 200
        // bytes slide down to the prepend reserve.
        buffer.append(&vec![2u8; 900]);
        assert_eq!(buffer.buf.len(), capacity_before);
        assert_eq!(buffer.readable_bytes(), 1100);
        assert_eq!(&buffer.peek()[..200], &[1u8; 200][..]);
        assert_eq!(&buffer.peek()[200..], &[2u8; 900][..]);
        assert_invariants(&buffer);
    }

    #[test]
    fn capacity_is_monotonic() {
        let mut buffer = Buffer::new();
        let mut capacity = buffer.buf.len();
        for chunk in 0..100 {
            buffer.append(&vec![chunk as u8; 97]);
            if chunk % 3 == 0 {
                buffer.retrieve(31);
            }
            assert!(buffer.buf.len() >= capacity);
            capacity = buffer.buf.len();
            assert_invariants(&buffer);
        }
    }

    #[test]
    fn scatter_read_spills_into_overflow() {
        let (mut sender, receiver) = UnixStream::pair().unwrap();
        let data: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        sender.write_all(&data).unwrap();

        // 16 writable bytes forces most of the payload through the overflow
        // region and back via append.
        let mut buffer = Buffer::with_capacity(16);
        let n = buffer.read_from_fd(receiver.as_raw_fd()).unwrap();
        assert_eq!(n, data.len());
        assert_eq!(buffer.peek(), &data[..]);
        assert_invariants(&buffer);
    }

    #[test]
    fn read_fits_in_writable_region() {
        let (mut sender, receiver) = UnixStream::pair().unwrap();
        sender.write_all(b"tiny").unwrap();

        let mut buffer = Buffer::new();
        let n = buffer.read_from_fd(receiver.as_raw_fd()).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buffer.peek(), b"tiny");
    }

    #[test]
    fn write_to_fd_leaves_cursor_to_caller() {
        let (sender, mut receiver) = UnixStream::pair().unwrap();
        let mut buffer = Buffer::new();
        buffer.append(b"payload");
        let n = buffer.write_to_fd(sender.as_raw_fd()).unwrap();
        assert_eq!(n, 7);
        assert_eq!(buffer.readable_bytes(), 7);
        buffer.retrieve(n);
        assert_eq!(buffer.readable_bytes(), 0);

        let mut out = [0u8; 7];
        use std::io::Read;
        receiver.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"payload");
    }

    #[test]
    fn write_to_fd_error_keeps_errno() {
        let mut buffer = Buffer::new();
        buffer.append(b"doomed");
        let err = buffer.write_to_fd(-1).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
        // The failed write consumed nothing.
        assert_eq!(buffer.readable_bytes(), 6);
    }
}
