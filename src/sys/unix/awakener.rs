pub use self::pipe::Awakener;

/// Default awakener backed by a pipe
mod pipe {
    use crate::sys::event::Ready;
    use crate::sys::unix::{self, Selector};
    use crate::sys::Token;
    use std::io::{self, Read, Write};

    /*
     *
     * ===== Awakener =====
     *
     */

    /// Unblocks a selector from another thread.
    ///
    /// The reader end is registered with the loop's selector; `wakeup` writes
    /// a byte from any thread, which makes the selector's wait return.
    #[derive(Debug)]
    pub struct Awakener {
        reader: unix::Io,
        writer: unix::Io,
    }

    impl Awakener {
        pub fn new() -> io::Result<Awakener> {
            let (rd, wr) = unix::pipe()?;

            Ok(Awakener {
                reader: rd,
                writer: wr,
            })
        }

        /// Registers the reader end with `selector` under `token`.
        pub fn register(&self, selector: &Selector, token: Token) -> io::Result<()> {
            use std::os::unix::io::AsRawFd;
            selector.register(self.reader.as_raw_fd(), token, Ready::readable())
        }

        pub fn wakeup(&self) -> io::Result<()> {
            match (&self.writer).write(&[1]) {
                Ok(_) => Ok(()),
                Err(e) => {
                    if e.kind() == io::ErrorKind::WouldBlock {
                        // The pipe is full; the loop is already pending wakeup.
                        Ok(())
                    } else {
                        Err(e)
                    }
                }
            }
        }

        pub fn cleanup(&self) {
            let mut buf = [0; 128];

            loop {
                // Consume data until all bytes are purged
                match (&self.reader).read(&mut buf) {
                    Ok(i) if i > 0 => {}
                    _ => return,
                }
            }
        }
    }
}
