use std::cell::{Cell, RefCell};
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::FromRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use sluice_reactor::Handle;

use super::{Done, Outstanding, ReadDone, StreamKind, Transport};
use crate::{Error, Result};

const LOG: &str = "sluice::file";

/// Bytes requested when the caller lets the transport choose.
const DEFAULT_READ: usize = 8192;

/// Options and flags which can be used to configure how a file is opened.
///
/// Generally speaking, when using `OpenOptions`, you'll first call
/// [`OpenOptions::new`], then chain calls to methods to set each option, then
/// call [`OpenOptions::transport`], passing the path of the file you're trying
/// to open. The file itself is opened by [`Transport::open`].
#[derive(Debug, Copy, Clone, Default)]
pub struct OpenOptions {
    read: bool,
    write: bool,
    append: bool,
    truncate: bool,
    create: bool,
    create_new: bool,
    direct: bool,
    sync: bool,
    dsync: bool,
}

impl OpenOptions {
    /// Creates a blank new set of options ready for configuration.
    ///
    /// All options are initially set to `false`.
    pub fn new() -> Self {
        Self {
            ..Default::default()
        }
    }

    /// Sets the option for read access.
    pub fn read(&mut self, read: bool) -> &mut Self {
        self.read = read;
        self
    }

    /// Sets the option for write access.
    ///
    /// If the file already exists, writes overwrite its contents without
    /// truncating it.
    pub fn write(&mut self, write: bool) -> &mut Self {
        self.write = write;
        self
    }

    /// Sets the option for the append mode.
    ///
    /// Setting `.write(true).append(true)` has the same effect as setting
    /// only `.append(true)`.
    pub fn append(&mut self, append: bool) -> &mut Self {
        self.append = append;
        self
    }

    /// Sets the option for truncating a previous file.
    ///
    /// The file must be opened with write access for truncate to work.
    pub fn truncate(&mut self, truncate: bool) -> &mut Self {
        self.truncate = truncate;
        self
    }

    /// Sets the option to create a new file, or open it if it already exists.
    pub fn create(&mut self, create: bool) -> &mut Self {
        self.create = create;
        self
    }

    /// Sets the option to create a new file, failing if it already exists.
    ///
    /// If `.create_new(true)` is set, [`OpenOptions::create`] and
    /// [`OpenOptions::truncate`] are ignored.
    pub fn create_new(&mut self, create_new: bool) -> &mut Self {
        self.create_new = create_new;
        self
    }

    /// Sets the option to open this file in O_DIRECT mode.
    pub fn direct(&mut self, direct: bool) -> &mut Self {
        self.direct = direct;
        self
    }

    /// Sets the option to open this file in O_SYNC mode.
    pub fn sync(&mut self, sync: bool) -> &mut Self {
        self.sync = sync;
        self
    }

    /// Sets the option to open this file in O_DSYNC mode.
    pub fn dsync(&mut self, dsync: bool) -> &mut Self {
        self.dsync = dsync;
        self
    }

    /// Create a file transport for `path` with these options.
    ///
    /// ### Panics
    /// Panics if called outside of a reactor context.
    #[track_caller]
    pub fn transport<P: AsRef<Path>>(&self, path: P) -> FileTransport {
        FileTransport::with_handle(Handle::current(), path, *self)
    }

    fn open_file(&self, path: &Path) -> io::Result<File> {
        let path = CString::new(path.as_os_str().as_bytes())?;
        let flags = libc::O_CLOEXEC | self.get_access_mode()? | self.get_creation_mode()?;
        // Safety: `path` is a valid NUL terminated string for the duration of the call.
        let fd = unsafe { libc::open(path.as_ptr(), flags, 0o666 as libc::c_uint) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: `fd` was just opened and is owned by nothing else.
        Ok(unsafe { File::from_raw_fd(fd) })
    }

    fn get_access_mode(&self) -> io::Result<i32> {
        let mut access_mode = match (self.read, self.write, self.append) {
            (true, false, false) => libc::O_RDONLY,
            (false, true, false) => libc::O_WRONLY,
            (true, true, false) => libc::O_RDWR,
            (false, _, true) => libc::O_WRONLY | libc::O_APPEND,
            (true, _, true) => libc::O_RDWR | libc::O_APPEND,
            (false, false, false) => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
        };

        if self.direct {
            access_mode |= libc::O_DIRECT;
        }
        if self.sync {
            access_mode |= libc::O_SYNC;
        }
        if self.dsync {
            access_mode |= libc::O_DSYNC;
        }
        Ok(access_mode)
    }

    fn get_creation_mode(&self) -> io::Result<i32> {
        match (self.write, self.append) {
            (true, false) => {}
            (false, false) => {
                if self.truncate || self.create || self.create_new {
                    return Err(io::Error::from_raw_os_error(libc::EINVAL));
                }
            }
            (_, true) => {
                if self.truncate && !self.create_new {
                    return Err(io::Error::from_raw_os_error(libc::EINVAL));
                }
            }
        }

        let res = match (self.create, self.truncate, self.create_new) {
            (false, false, false) => 0,
            (true, false, false) => libc::O_CREAT,
            (false, true, false) => libc::O_TRUNC,
            (true, true, false) => libc::O_CREAT | libc::O_TRUNC,
            (_, _, true) => libc::O_CREAT | libc::O_EXCL,
        };

        Ok(res)
    }
}

/// A transport over a file on disk.
///
/// Reads and writes are positional against a tracked offset. The file is
/// opened by [`Transport::open`] and closed by [`Transport::close`], so a
/// failed open can be retried on the same transport.
#[derive(Debug)]
pub struct FileTransport {
    shared: Rc<Shared>,
    work: Outstanding,
}

#[derive(Debug)]
struct Shared {
    path: PathBuf,
    opts: OpenOptions,
    file: RefCell<Option<File>>,
    offset: Cell<u64>,
}

impl Shared {
    fn open(&self) -> Result<()> {
        let file = self.opts.open_file(&self.path).map_err(Error::from)?;
        let offset = if self.opts.append {
            file.metadata().map_err(Error::from)?.len()
        } else {
            0
        };
        debug!(target: LOG, "file.open {} fd={:?}", self.path.display(), file);
        *self.file.borrow_mut() = Some(file);
        self.offset.set(offset);
        Ok(())
    }

    fn close(&self) {
        if let Some(file) = self.file.borrow_mut().take() {
            trace!(target: LOG, "file.close {}", self.path.display());
            drop(file);
        }
    }

    fn with_file<T>(&self, f: impl FnOnce(&File) -> io::Result<T>) -> Result<T> {
        match self.file.borrow().as_ref() {
            Some(file) => f(file).map_err(Error::from),
            None => Err(Error::closed()),
        }
    }
}

impl FileTransport {
    /// Create a transport which opens `path` for reading.
    ///
    /// ### Panics
    /// Panics if called outside of a reactor context.
    #[track_caller]
    pub fn read_only<P: AsRef<Path>>(path: P) -> Self {
        OpenOptions::new().read(true).transport(path)
    }

    /// Create a transport which creates or truncates `path` for writing.
    ///
    /// ### Panics
    /// Panics if called outside of a reactor context.
    #[track_caller]
    pub fn create<P: AsRef<Path>>(path: P) -> Self {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .transport(path)
    }

    /// Create a transport for `path` which queues completions on `handle`.
    pub fn with_handle<P: AsRef<Path>>(handle: Handle, path: P, opts: OpenOptions) -> Self {
        Self {
            shared: Rc::new(Shared {
                path: path.as_ref().to_owned(),
                opts,
                file: RefCell::new(None),
                offset: Cell::new(0),
            }),
            work: Outstanding::new(handle),
        }
    }

    /// The path this transport opens.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }
}

impl Transport for FileTransport {
    fn kind(&self) -> StreamKind {
        StreamKind::File
    }

    fn open(&self, done: Done<()>) {
        let shared = self.shared.clone();
        self.work.post(move |res| done(res.and_then(|()| shared.open())));
    }

    fn open_try(&self) -> bool {
        match self.shared.open() {
            Ok(()) => true,
            Err(e) => {
                debug!(target: LOG, "file.open_try {} {}", self.shared.path.display(), e);
                false
            }
        }
    }

    fn close(&self, done: Done<()>) {
        let shared = self.shared.clone();
        self.work.post(move |res| {
            shared.close();
            done(res)
        });
    }

    fn close_try(&self) -> bool {
        self.shared.close();
        true
    }

    fn release(&self) {
        self.shared.close();
    }

    fn read(&self, mut buf: BytesMut, want: usize, done: ReadDone) {
        let shared = self.shared.clone();
        self.work.post(move |res| {
            if let Err(e) = res {
                return done(buf, Err(e));
            }
            let want = if want == 0 { DEFAULT_READ } else { want };
            let start = buf.len();
            buf.resize(start + want, 0);
            let offset = shared.offset.get();
            let res = shared.with_file(|file| file.read_at(&mut buf[start..], offset));
            match res {
                Ok(0) => {
                    buf.truncate(start);
                    done(buf, Err(Error::closed()))
                }
                Ok(n) => {
                    buf.truncate(start + n);
                    shared.offset.set(offset + n as u64);
                    trace!(target: LOG, "file.read {} at {}", n, offset);
                    done(buf, Ok(n))
                }
                Err(e) => {
                    buf.truncate(start);
                    done(buf, Err(e))
                }
            }
        });
    }

    fn writ(&self, data: Bytes, done: Done<usize>) {
        let shared = self.shared.clone();
        self.work.post(move |res| {
            let offset = shared.offset.get();
            let res = res.and_then(|()| shared.with_file(|file| file.write_at(&data, offset)));
            if let Ok(n) = res {
                shared.offset.set(offset + n as u64);
                trace!(target: LOG, "file.writ {} at {}", n, offset);
            }
            done(res)
        });
    }

    fn seek(&self, offset: u64, done: Done<u64>) {
        let shared = self.shared.clone();
        self.work.post(move |res| {
            let res = res.and_then(|()| shared.with_file(|_| Ok(())));
            if res.is_ok() {
                shared.offset.set(offset);
            }
            done(res.map(|()| offset))
        });
    }

    fn sync(&self, closing: bool, done: Done<()>) {
        let shared = self.shared.clone();
        self.work.post(move |res| {
            let res = res.and_then(|()| {
                shared.with_file(|file| {
                    if closing {
                        file.sync_all()
                    } else {
                        file.sync_data()
                    }
                })
            });
            done(res)
        });
    }

    fn task(&self, delay: Duration, done: Done<()>) {
        self.work.post_after(delay, done);
    }

    fn kill(&self) {
        if self.work.kill() {
            trace!(target: LOG, "file.kill cancelled outstanding work");
        }
    }

    fn offset(&self) -> u64 {
        self.shared.offset.get()
    }

    fn size(&self) -> Option<u64> {
        self.shared
            .with_file(|file| file.metadata())
            .ok()
            .map(|m| m.len())
    }
}
