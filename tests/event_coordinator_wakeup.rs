//! End-to-end scenario 6 from spec §8: a consumer submits `wait_messages`
//! on its read arena, a forked peer `send`s one message, and the consumer's
//! own `wait_for_completion`/`handle_event` pair — not a `receive()`
//! spin-loop — is what observes the wakeup and tells it a message is ready.
#![cfg(target_os = "linux")]

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{IntoRawFd, RawFd};

use nix::sys::wait::waitpid;
use nix::unistd::{fork, pipe, ForkResult};
use peerlink::event::Handled;
use peerlink::transport::shm::{create_mapping, ShmTransport};
use peerlink::transport::{MessageView, MessageWriter, Transport};

const BUFFER_SIZE: u64 = 768;
const MAX_MESSAGE_SIZE: u64 = 128;

fn dup(fd: RawFd) -> RawFd {
    // SAFETY: fd is open and owned by this process.
    unsafe { libc::dup(fd) }
}

#[test]
fn futex_wakeup_round_trip_delivers_message() {
    let parent_fd = create_mapping("wakeup-parent", BUFFER_SIZE).unwrap().into_raw_fd();
    let child_fd = create_mapping("wakeup-child", BUFFER_SIZE).unwrap().into_raw_fd();

    // One-byte handshake: the parent only signals "go" once its
    // `wait_messages` futex-wait has actually been submitted to the
    // kernel, so the child's `send` can never race ahead of it.
    let (go_r, go_w) = pipe().unwrap();
    let mut go_r: File = File::from(go_r);
    let mut go_w: File = File::from(go_w);

    // SAFETY: single-threaded test process at the point of fork.
    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            drop(go_w);
            let mut buf = [0u8; 1];
            go_r.read_exact(&mut buf).unwrap();

            let mut transport =
                ShmTransport::init("wakeup-child", dup(parent_fd), child_fd, MAX_MESSAGE_SIZE)
                    .unwrap();
            let mut writer = transport.message_init().unwrap().unwrap();
            writer.write_bytes(b"wakeup payload").unwrap();
            writer.send().unwrap();
            std::process::exit(0);
        }
        ForkResult::Parent { child } => {
            drop(go_r);
            let mut transport =
                ShmTransport::init("wakeup-parent", dup(child_fd), parent_fd, MAX_MESSAGE_SIZE)
                    .unwrap();

            transport.wait_for_messages().unwrap();
            go_w.write_all(&[1]).unwrap();
            drop(go_w);

            let message = loop {
                match transport.poll_completion().unwrap() {
                    Handled::MessageReady { .. } => {
                        let message = transport.receive().unwrap();
                        match message {
                            Some(message) => break message,
                            // The wake landed but the dequeue raced ahead
                            // of the enqueue; go back to waiting.
                            None => {
                                transport.wait_for_messages().unwrap();
                                continue;
                            }
                        }
                    }
                    Handled::Retry | Handled::WakeAcked { .. } => continue,
                }
            };

            assert_eq!(message.bytes(), b"wakeup payload");
            message.release().unwrap();
            waitpid(child, None).unwrap();
        }
    }

    unsafe {
        libc::close(parent_fd);
        libc::close(child_fd);
    }
}
