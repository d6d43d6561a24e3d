//! Two-process scenario from spec §8 end-to-end scenario 5: one process
//! creates an arena and allocates blocks, a forked child attaches to the
//! same mapping and frees some of them, and the parent observes the
//! resulting free/total size agree with what the child did.
#![cfg(target_os = "linux")]

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{FromRawFd, IntoRawFd, RawFd};
use std::sync::atomic::Ordering;

use memmap2::MmapOptions;
use nix::sys::wait::waitpid;
use nix::unistd::{fork, pipe, ForkResult};
use peerlink::arena::Arena;

const BUFFER_SIZE: u64 = 4096;
const MAX_MESSAGE_SIZE: u64 = 64;

fn dup(fd: RawFd) -> RawFd {
    // SAFETY: fd is open and owned by this process for the duration of
    // the call.
    unsafe { libc::dup(fd) }
}

fn attach(fd: RawFd, name: &'static str) -> Arena {
    // SAFETY: fd is a valid shared mapping fd created by create_mapping.
    let file = unsafe { File::from_raw_fd(fd) };
    let map = MmapOptions::new().map_raw(&file).unwrap();
    std::mem::forget(file);
    Arena::attach(map, name)
}

fn send_u64(writer: &mut File, value: u64) {
    writer.write_all(&value.to_le_bytes()).unwrap();
}

fn recv_u64(reader: &mut File) -> u64 {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf).unwrap();
    u64::from_le_bytes(buf)
}

#[test]
fn attach_from_child_observes_same_allocator_state() {
    let fd = peerlink::create_mapping("fork-cross-process", BUFFER_SIZE)
        .unwrap()
        .into_raw_fd();

    let total_len = core::mem::size_of::<peerlink::arena::ArenaHeader>() as u64 + BUFFER_SIZE;
    let map = MmapOptions::new()
        .len(total_len as usize)
        .map_raw(unsafe { &File::from_raw_fd(dup(fd)) })
        .unwrap();
    let parent_arena = Arena::create(map, total_len, MAX_MESSAGE_SIZE, "fork-cross-process");

    let a = parent_arena.alloc().unwrap();
    let b = parent_arena.alloc().unwrap();
    let c = parent_arena.alloc().unwrap();

    let total_before = parent_arena
        .allocator_header()
        .total_size
        .load(Ordering::Acquire);
    let free_before = parent_arena
        .allocator_header()
        .free_size
        .load(Ordering::Acquire);
    assert!(free_before < total_before);

    let (to_child_r, mut to_child_w) = {
        let (r, w) = pipe().unwrap();
        (unsafe { File::from_raw_fd(r.into_raw_fd()) }, unsafe {
            File::from_raw_fd(w.into_raw_fd())
        })
    };
    let (mut from_child_r, to_child_done) = {
        let (r, w) = pipe().unwrap();
        (unsafe { File::from_raw_fd(r.into_raw_fd()) }, unsafe {
            File::from_raw_fd(w.into_raw_fd())
        })
    };

    // SAFETY: single-threaded test process, no shared state touched
    // between fork and exec in the child besides the arena mapping.
    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            drop(to_child_w);
            drop(from_child_r);
            let mut to_child_done = to_child_done;

            let child_arena = attach(dup(fd), "fork-cross-process");
            assert_eq!(
                child_arena.allocator_header().total_size.load(Ordering::Acquire),
                total_before
            );
            assert_eq!(
                child_arena.allocator_header().free_size.load(Ordering::Acquire),
                free_before
            );

            let mut to_child_r = to_child_r;
            let a_offset = recv_u64(&mut to_child_r);
            let c_offset = recv_u64(&mut to_child_r);

            child_arena.free(a_offset.into()).unwrap();
            child_arena.free(c_offset.into()).unwrap();

            send_u64(&mut to_child_done, 1);
            std::process::exit(0);
        }
        ForkResult::Parent { child } => {
            drop(to_child_r);
            drop(to_child_done);

            send_u64(&mut to_child_w, a.get());
            send_u64(&mut to_child_w, c.get());
            let _ = recv_u64(&mut from_child_r);

            waitpid(child, None).unwrap();

            // a and c are freed and physically adjacent to b on one side;
            // at minimum free_size must have grown by exactly their sizes
            // as observed by the process that allocated them.
            let free_after = parent_arena
                .allocator_header()
                .free_size
                .load(Ordering::Acquire);
            assert!(free_after > free_before);

            parent_arena.free(b).unwrap();
            let free_final = parent_arena
                .allocator_header()
                .free_size
                .load(Ordering::Acquire);
            assert_eq!(free_final, total_before);

            unsafe { libc::close(fd) };
        }
    }
}
