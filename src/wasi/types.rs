//! WASI preview1 ABI types: errno values, flag bits, and byte-exact
//! writers for the witx-defined structures.

#![allow(dead_code, reason = "the full witx constant set is kept in one place")]

use std::io;

// errno values, byte-for-byte from the preview1 witx
pub const ERRNO_SUCCESS: u16 = 0;
pub const ERRNO_2BIG: u16 = 1;
pub const ERRNO_ACCES: u16 = 2;
pub const ERRNO_ADDRINUSE: u16 = 3;
pub const ERRNO_ADDRNOTAVAIL: u16 = 4;
pub const ERRNO_AFNOSUPPORT: u16 = 5;
pub const ERRNO_AGAIN: u16 = 6;
pub const ERRNO_ALREADY: u16 = 7;
pub const ERRNO_BADF: u16 = 8;
pub const ERRNO_BADMSG: u16 = 9;
pub const ERRNO_BUSY: u16 = 10;
pub const ERRNO_CANCELED: u16 = 11;
pub const ERRNO_CHILD: u16 = 12;
pub const ERRNO_CONNABORTED: u16 = 13;
pub const ERRNO_CONNREFUSED: u16 = 14;
pub const ERRNO_CONNRESET: u16 = 15;
pub const ERRNO_DEADLK: u16 = 16;
pub const ERRNO_DESTADDRREQ: u16 = 17;
pub const ERRNO_DOM: u16 = 18;
pub const ERRNO_DQUOT: u16 = 19;
pub const ERRNO_EXIST: u16 = 20;
pub const ERRNO_FAULT: u16 = 21;
pub const ERRNO_FBIG: u16 = 22;
pub const ERRNO_HOSTUNREACH: u16 = 23;
pub const ERRNO_IDRM: u16 = 24;
pub const ERRNO_ILSEQ: u16 = 25;
pub const ERRNO_INPROGRESS: u16 = 26;
pub const ERRNO_INTR: u16 = 27;
pub const ERRNO_INVAL: u16 = 28;
pub const ERRNO_IO: u16 = 29;
pub const ERRNO_ISCONN: u16 = 30;
pub const ERRNO_ISDIR: u16 = 31;
pub const ERRNO_LOOP: u16 = 32;
pub const ERRNO_MFILE: u16 = 33;
pub const ERRNO_MLINK: u16 = 34;
pub const ERRNO_MSGSIZE: u16 = 35;
pub const ERRNO_MULTIHOP: u16 = 36;
pub const ERRNO_NAMETOOLONG: u16 = 37;
pub const ERRNO_NETDOWN: u16 = 38;
pub const ERRNO_NETRESET: u16 = 39;
pub const ERRNO_NETUNREACH: u16 = 40;
pub const ERRNO_NFILE: u16 = 41;
pub const ERRNO_NOBUFS: u16 = 42;
pub const ERRNO_NODEV: u16 = 43;
pub const ERRNO_NOENT: u16 = 44;
pub const ERRNO_NOEXEC: u16 = 45;
pub const ERRNO_NOLCK: u16 = 46;
pub const ERRNO_NOLINK: u16 = 47;
pub const ERRNO_NOMEM: u16 = 48;
pub const ERRNO_NOMSG: u16 = 49;
pub const ERRNO_NOPROTOOPT: u16 = 50;
pub const ERRNO_NOSPC: u16 = 51;
pub const ERRNO_NOSYS: u16 = 52;
pub const ERRNO_NOTCONN: u16 = 53;
pub const ERRNO_NOTDIR: u16 = 54;
pub const ERRNO_NOTEMPTY: u16 = 55;
pub const ERRNO_NOTRECOVERABLE: u16 = 56;
pub const ERRNO_NOTSOCK: u16 = 57;
pub const ERRNO_NOTSUP: u16 = 58;
pub const ERRNO_NOTTY: u16 = 59;
pub const ERRNO_NXIO: u16 = 60;
pub const ERRNO_OVERFLOW: u16 = 61;
pub const ERRNO_OWNERDEAD: u16 = 62;
pub const ERRNO_PERM: u16 = 63;
pub const ERRNO_PIPE: u16 = 64;
pub const ERRNO_PROTO: u16 = 65;
pub const ERRNO_PROTONOSUPPORT: u16 = 66;
pub const ERRNO_PROTOTYPE: u16 = 67;
pub const ERRNO_RANGE: u16 = 68;
pub const ERRNO_ROFS: u16 = 69;
pub const ERRNO_SPIPE: u16 = 70;
pub const ERRNO_SRCH: u16 = 71;
pub const ERRNO_STALE: u16 = 72;
pub const ERRNO_TIMEDOUT: u16 = 73;
pub const ERRNO_TXTBSY: u16 = 74;
pub const ERRNO_XDEV: u16 = 75;
pub const ERRNO_NOTCAPABLE: u16 = 76;

// filetypes
pub const FILETYPE_UNKNOWN: u8 = 0;
pub const FILETYPE_BLOCK_DEVICE: u8 = 1;
pub const FILETYPE_CHARACTER_DEVICE: u8 = 2;
pub const FILETYPE_DIRECTORY: u8 = 3;
pub const FILETYPE_REGULAR_FILE: u8 = 4;
pub const FILETYPE_SOCKET_DGRAM: u8 = 5;
pub const FILETYPE_SOCKET_STREAM: u8 = 6;
pub const FILETYPE_SYMBOLIC_LINK: u8 = 7;

// clock ids
pub const CLOCKID_REALTIME: u32 = 0;
pub const CLOCKID_MONOTONIC: u32 = 1;
pub const CLOCKID_PROCESS_CPUTIME_ID: u32 = 2;
pub const CLOCKID_THREAD_CPUTIME_ID: u32 = 3;

// whence
pub const WHENCE_SET: u8 = 0;
pub const WHENCE_CUR: u8 = 1;
pub const WHENCE_END: u8 = 2;

// open flags
pub const OFLAGS_CREAT: u16 = 1 << 0;
pub const OFLAGS_DIRECTORY: u16 = 1 << 1;
pub const OFLAGS_EXCL: u16 = 1 << 2;
pub const OFLAGS_TRUNC: u16 = 1 << 3;

// fd flags
pub const FDFLAGS_APPEND: u16 = 1 << 0;
pub const FDFLAGS_DSYNC: u16 = 1 << 1;
pub const FDFLAGS_NONBLOCK: u16 = 1 << 2;
pub const FDFLAGS_RSYNC: u16 = 1 << 3;
pub const FDFLAGS_SYNC: u16 = 1 << 4;

// rights bits (the ones this implementation inspects)
pub const RIGHTS_FD_READ: u64 = 1 << 1;
pub const RIGHTS_FD_WRITE: u64 = 1 << 6;

// lookup flags
pub const LOOKUPFLAGS_SYMLINK_FOLLOW: u32 = 1 << 0;

// fst flags (filestat_set_times)
pub const FSTFLAGS_ATIM: u16 = 1 << 0;
pub const FSTFLAGS_ATIM_NOW: u16 = 1 << 1;
pub const FSTFLAGS_MTIM: u16 = 1 << 2;
pub const FSTFLAGS_MTIM_NOW: u16 = 1 << 3;

// subscription/event types
pub const EVENTTYPE_CLOCK: u8 = 0;
pub const EVENTTYPE_FD_READ: u8 = 1;
pub const EVENTTYPE_FD_WRITE: u8 = 2;
pub const SUBCLOCKFLAGS_ABSTIME: u16 = 1 << 0;

// prestat tags
pub const PREOPENTYPE_DIR: u8 = 0;

pub const FILESTAT_SIZE: u32 = 64;
pub const FDSTAT_SIZE: u32 = 24;
pub const PRESTAT_SIZE: u32 = 8;
pub const DIRENT_SIZE: u32 = 24;
pub const SUBSCRIPTION_SIZE: u32 = 48;
pub const EVENT_SIZE: u32 = 32;
pub const IOVEC_SIZE: u32 = 8;

/// Map a host I/O error onto a WASI errno.
pub fn errno_from_io(e: &io::Error) -> u16 {
    use io::ErrorKind as K;
    match e.kind() {
        K::NotFound => ERRNO_NOENT,
        K::PermissionDenied => ERRNO_ACCES,
        K::AlreadyExists => ERRNO_EXIST,
        K::InvalidInput => ERRNO_INVAL,
        K::WouldBlock => ERRNO_AGAIN,
        K::BrokenPipe => ERRNO_PIPE,
        K::WriteZero => ERRNO_NOSPC,
        K::Unsupported => ERRNO_NOTSUP,
        K::TimedOut => ERRNO_TIMEDOUT,
        K::Interrupted => ERRNO_INTR,
        K::DirectoryNotEmpty => ERRNO_NOTEMPTY,
        K::NotADirectory => ERRNO_NOTDIR,
        K::IsADirectory => ERRNO_ISDIR,
        _ => ERRNO_IO,
    }
}

/// `wasi_filestat`, 64 bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Filestat {
    pub dev: u64,
    pub ino: u64,
    pub filetype: u8,
    pub nlink: u64,
    pub size: u64,
    pub atim: u64,
    pub mtim: u64,
    pub ctim: u64,
}

impl Filestat {
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut b = [0u8; 64];
        b[0..8].copy_from_slice(&self.dev.to_le_bytes());
        b[8..16].copy_from_slice(&self.ino.to_le_bytes());
        b[16] = self.filetype;
        b[24..32].copy_from_slice(&self.nlink.to_le_bytes());
        b[32..40].copy_from_slice(&self.size.to_le_bytes());
        b[40..48].copy_from_slice(&self.atim.to_le_bytes());
        b[48..56].copy_from_slice(&self.mtim.to_le_bytes());
        b[56..64].copy_from_slice(&self.ctim.to_le_bytes());
        b
    }
}

/// `wasi_fdstat`, 24 bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fdstat {
    pub filetype: u8,
    pub flags: u16,
    pub rights_base: u64,
    pub rights_inheriting: u64,
}

impl Fdstat {
    pub fn to_bytes(&self) -> [u8; 24] {
        let mut b = [0u8; 24];
        b[0] = self.filetype;
        b[2..4].copy_from_slice(&self.flags.to_le_bytes());
        b[8..16].copy_from_slice(&self.rights_base.to_le_bytes());
        b[16..24].copy_from_slice(&self.rights_inheriting.to_le_bytes());
        b
    }
}

/// `wasi_fd_prestat`, 8 bytes.
pub fn prestat_dir_bytes(name_len: u32) -> [u8; 8] {
    let mut b = [0u8; 8];
    b[0] = PREOPENTYPE_DIR;
    b[4..8].copy_from_slice(&name_len.to_le_bytes());
    b
}

/// `wasi_dirent` header, 24 bytes (the name follows unstructured).
pub fn dirent_bytes(d_next: u64, d_ino: u64, d_namlen: u32, d_type: u8) -> [u8; 24] {
    let mut b = [0u8; 24];
    b[0..8].copy_from_slice(&d_next.to_le_bytes());
    b[8..16].copy_from_slice(&d_ino.to_le_bytes());
    b[16..20].copy_from_slice(&d_namlen.to_le_bytes());
    b[20] = d_type;
    b
}

/// `wasi_event`, 32 bytes.
pub fn event_bytes(userdata: u64, error: u16, ty: u8, nbytes: u64, flags: u16) -> [u8; 32] {
    let mut b = [0u8; 32];
    b[0..8].copy_from_slice(&userdata.to_le_bytes());
    b[8..10].copy_from_slice(&error.to_le_bytes());
    b[10] = ty;
    b[16..24].copy_from_slice(&nbytes.to_le_bytes());
    b[24..26].copy_from_slice(&flags.to_le_bytes());
    b
}

/// One parsed `wasi_subscription` (48 bytes on the wire).
#[derive(Debug, Clone, Copy)]
pub enum Subscription {
    Clock {
        userdata: u64,
        clock_id: u32,
        timeout: u64,
        abstime: bool,
    },
    FdRead { userdata: u64, fd: u32 },
    FdWrite { userdata: u64, fd: u32 },
    Unknown { userdata: u64 },
}

impl Subscription {
    pub fn parse(b: &[u8]) -> Self {
        debug_assert_eq!(b.len(), SUBSCRIPTION_SIZE as usize);
        let userdata = u64::from_le_bytes(b[0..8].try_into().expect("8 bytes"));
        let tag = b[8];
        match tag {
            EVENTTYPE_CLOCK => {
                let clock_id = u32::from_le_bytes(b[16..20].try_into().expect("4 bytes"));
                let timeout = u64::from_le_bytes(b[24..32].try_into().expect("8 bytes"));
                let flags = u16::from_le_bytes(b[40..42].try_into().expect("2 bytes"));
                Subscription::Clock {
                    userdata,
                    clock_id,
                    timeout,
                    abstime: flags & SUBCLOCKFLAGS_ABSTIME != 0,
                }
            }
            EVENTTYPE_FD_READ => Subscription::FdRead {
                userdata,
                fd: u32::from_le_bytes(b[16..20].try_into().expect("4 bytes")),
            },
            EVENTTYPE_FD_WRITE => Subscription::FdWrite {
                userdata,
                fd: u32::from_le_bytes(b[16..20].try_into().expect("4 bytes")),
            },
            _ => Subscription::Unknown { userdata },
        }
    }

    pub fn userdata(&self) -> u64 {
        match *self {
            Subscription::Clock { userdata, .. }
            | Subscription::FdRead { userdata, .. }
            | Subscription::FdWrite { userdata, .. }
            | Subscription::Unknown { userdata } => userdata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filestat_layout() {
        let st = Filestat {
            dev: 1,
            ino: 2,
            filetype: FILETYPE_REGULAR_FILE,
            nlink: 3,
            size: 0x1122334455667788,
            atim: 5,
            mtim: 6,
            ctim: 7,
        };
        let b = st.to_bytes();
        assert_eq!(b[16], 4);
        assert_eq!(&b[32..40], &0x1122334455667788u64.to_le_bytes());
        assert_eq!(b.len(), FILESTAT_SIZE as usize);
    }

    #[test]
    fn fdstat_layout() {
        let b = Fdstat {
            filetype: FILETYPE_DIRECTORY,
            flags: FDFLAGS_APPEND,
            rights_base: !0,
            rights_inheriting: 0,
        }
        .to_bytes();
        assert_eq!(b[0], 3);
        assert_eq!(u16::from_le_bytes([b[2], b[3]]), 1);
        assert_eq!(u64::from_le_bytes(b[8..16].try_into().unwrap()), !0);
    }

    #[test]
    fn subscription_clock_roundtrip() {
        let mut b = [0u8; 48];
        b[0..8].copy_from_slice(&7u64.to_le_bytes());
        b[8] = EVENTTYPE_CLOCK;
        b[16..20].copy_from_slice(&CLOCKID_MONOTONIC.to_le_bytes());
        b[24..32].copy_from_slice(&1_000_000u64.to_le_bytes());
        match Subscription::parse(&b) {
            Subscription::Clock {
                userdata,
                clock_id,
                timeout,
                abstime,
            } => {
                assert_eq!(userdata, 7);
                assert_eq!(clock_id, CLOCKID_MONOTONIC);
                assert_eq!(timeout, 1_000_000);
                assert!(!abstime);
            }
            other => panic!("{other:?}"),
        }
    }
}
