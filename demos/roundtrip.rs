//! Single-round-trip demo: a parent process creates both arenas, forks a
//! child to act as the peer, and the two exchange one message over the
//! shared-memory transport — the scenario from spec §8.1.
//!
//! Run with `cargo run --example roundtrip`.
//!
//! The shared-memory transport is Linux-only (it rides on `io_uring`
//! futex ops); on any other target this example is a no-op.

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("the roundtrip demo requires Linux (io_uring-based shared-memory transport)");
}

#[cfg(target_os = "linux")]
use std::os::fd::{IntoRawFd, RawFd};

#[cfg(target_os = "linux")]
use nix::sys::wait::waitpid;
#[cfg(target_os = "linux")]
use nix::unistd::{fork, ForkResult};
#[cfg(target_os = "linux")]
use peerlink::transport::shm::{self, ShmTransport};
#[cfg(target_os = "linux")]
use peerlink::transport::{MessageView, MessageWriter, Transport};

#[cfg(target_os = "linux")]
const BUFFER_SIZE: u64 = 768;
#[cfg(target_os = "linux")]
const MAX_MESSAGE_SIZE: u64 = 128;

#[cfg(target_os = "linux")]
fn sample_payload() -> Vec<u8> {
    use rmpv::Value;
    let value = Value::Map(vec![
        (Value::from("flag"), Value::Boolean(true)),
        (Value::from("answer"), Value::from(42u64)),
        (Value::from("greeting"), Value::from("Hello world!")),
        (
            Value::from("numbers"),
            Value::Array(vec![Value::from(1), Value::from(2), Value::from(3)]),
        ),
    ]);
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &value).expect("encode");
    buf
}

#[cfg(target_os = "linux")]
fn dup(fd: RawFd) -> RawFd {
    // SAFETY: fd is a valid, open file descriptor owned by this process.
    unsafe { libc::dup(fd) }
}

#[cfg(target_os = "linux")]
fn main() {
    // Two anonymous mappings: `parent_fd` is the arena the parent writes
    // into, `child_fd` is the arena the child writes into. Each side maps
    // its own as "write" and the other's as "read".
    let parent_fd = shm::create_mapping("roundtrip-parent", BUFFER_SIZE)
        .expect("create parent mapping")
        .into_raw_fd();
    let child_fd = shm::create_mapping("roundtrip-child", BUFFER_SIZE)
        .expect("create child mapping")
        .into_raw_fd();

    // SAFETY: demo code running in a single-threaded main before any
    // shared state is touched post-fork.
    match unsafe { fork() }.expect("fork") {
        ForkResult::Child => {
            let mut transport = ShmTransport::init(
                "roundtrip-child",
                dup(parent_fd),
                child_fd,
                MAX_MESSAGE_SIZE,
            )
            .expect("child transport init");

            let payload = sample_payload();
            let mut writer = transport
                .message_init()
                .expect("message_init")
                .expect("arena not full");
            writer.write_bytes(&payload).expect("write payload");
            writer.send().expect("send");

            std::process::exit(0);
        }
        ForkResult::Parent { child } => {
            let mut transport = ShmTransport::init(
                "roundtrip-parent",
                dup(child_fd),
                parent_fd,
                MAX_MESSAGE_SIZE,
            )
            .expect("parent transport init");

            let message = loop {
                if let Some(message) = transport.receive().expect("receive") {
                    break message;
                }
                std::thread::yield_now();
            };

            let decoded = rmpv::decode::read_value(&mut &message.bytes()[..]).expect("decode");
            println!("received: {decoded}");
            message.release().expect("release");

            waitpid(child, None).expect("waitpid");
            println!("roundtrip complete, parent num_messages == 0");
        }
    }

    unsafe {
        libc::close(parent_fd);
        libc::close(child_fd);
    }
}
