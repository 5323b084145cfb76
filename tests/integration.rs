//! End-to-end tests driving a real [`Programmer`] against a real
//! [`Target`] over loopback UDP, exercising the retry/timeout state
//! machine and planner the way actual hardware would.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use piclink::device::DeviceDescriptor;
use piclink::image::Image;
use piclink::programmer::{ProgramEvent, Programmer};
use piclink::protocol::{DiscoverReply, Operation, Status, HEADER_LEN, VERSION};
use piclink::target::Target;
use piclink::Error;

fn spawn_target(descriptor: &'static DeviceDescriptor) -> (thread::JoinHandle<()>, SocketAddr) {
    let (addr_tx, addr_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let bind_addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);
        let mut target = Target::bind(bind_addr, descriptor).expect("bind simulated target");
        addr_tx
            .send(target.local_addr().expect("local addr"))
            .expect("send local addr");

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let _ = target.serve_one(Duration::from_millis(200));
        }
    });
    let addr = addr_rx.recv().expect("target reports its bind address");
    (handle, addr)
}

fn v4(addr: SocketAddr) -> Ipv4Addr {
    match addr.ip() {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => panic!("expected an IPv4 loopback address"),
    }
}

fn bind_programmer() -> Programmer {
    Programmer::bind(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)).expect("bind programmer")
}

#[test]
fn connect_discovers_bootloader_identity() {
    let descriptor = DeviceDescriptor::find_by_name("PIC18F66J60").unwrap();
    let (_target, addr) = spawn_target(descriptor);

    let mut programmer = bind_programmer();
    let info = programmer
        .connect_device(v4(addr), addr.port())
        .expect("connect to simulated bootloader");

    assert_eq!(info.device_id, descriptor.dev_id << 5);
    assert_eq!(info.bootloader_address, 0xDEADBEEF);
    assert_eq!(programmer.peer(), Some(addr));
}

#[test]
fn program_then_read_back_matches_image() {
    let descriptor = DeviceDescriptor::find_by_name("PIC18F66J60").unwrap();
    let (_target, addr) = spawn_target(descriptor);

    let mut programmer = bind_programmer();
    programmer
        .connect_device(v4(addr), addr.port())
        .expect("connect to simulated bootloader");

    let mut image = Image::new();
    image.add(0x10, &[0xAA, 0xBB, 0xCC, 0xDD]).unwrap();
    // A second, disjoint section in a different erase page.
    image.add(0x500, &[1, 2, 3]).unwrap();

    let mut erases = 0;
    let mut writes = 0;
    programmer
        .program(&image, descriptor, |event| match event {
            ProgramEvent::Erasing { .. } => erases += 1,
            ProgramEvent::Writing { .. } => writes += 1,
        })
        .expect("program image");

    assert_eq!(erases, 2, "the two sections land on different erase pages");
    assert!(writes >= 2);

    let first = programmer.read(0x10, 4).unwrap();
    assert_eq!(first, vec![0xAA, 0xBB, 0xCC, 0xDD]);

    let second = programmer.read(0x500, 3).unwrap();
    assert_eq!(second, vec![1, 2, 3]);

    // Bytes around the written data, but still within the erased page,
    // read back as the flash idle byte.
    let idle = programmer.read(0x20, 4).unwrap();
    assert_eq!(idle, vec![0xff; 4]);
}

#[test]
fn planner_emits_single_erase_and_two_padded_writes_within_one_page() {
    // Mirrors the worked example in the planning algorithm: one byte at
    // 0x0400 and one at 0x0440, both inside the same 1024-byte erase page
    // and each on its own 64-byte write sector.
    let descriptor = DeviceDescriptor::find_by_name("PIC18F66J60").unwrap();
    let (_target, addr) = spawn_target(descriptor);

    let mut programmer = bind_programmer();
    programmer
        .connect_device(v4(addr), addr.port())
        .expect("connect to simulated bootloader");

    let mut image = Image::new();
    image.add(0x0400, &[0xAA]).unwrap();
    image.add(0x0440, &[0x55]).unwrap();

    let mut events = Vec::new();
    programmer
        .program(&image, descriptor, |event| events.push(event))
        .expect("program image");

    let erases = events
        .iter()
        .filter(|e| matches!(e, ProgramEvent::Erasing { .. }))
        .count();
    let writes = events
        .iter()
        .filter(|e| matches!(e, ProgramEvent::Writing { .. }))
        .count();
    assert_eq!(erases, 1, "both sectors fall on the same erase page");
    assert_eq!(writes, 2, "each byte lands in its own write sector");
    assert_eq!(events[0], ProgramEvent::Erasing { address: 0x0400 });

    let mut sector_one = vec![0xffu8; descriptor.write_size as usize];
    sector_one[0] = 0xAA;
    let mut sector_two = vec![0xffu8; descriptor.write_size as usize];
    sector_two[0] = 0x55;

    assert_eq!(
        programmer.read(0x0400, descriptor.write_size as u16).unwrap(),
        sector_one
    );
    assert_eq!(
        programmer.read(0x0440, descriptor.write_size as u16).unwrap(),
        sector_two
    );
}

#[test]
fn retry_reuses_sequence_and_tolerates_duplicate_reply() {
    // A hand-rolled peer (rather than `Target`) so the test can control
    // exactly when a reply goes missing: drop the first attempt, answer
    // the retry twice with identical bytes, then serve one more request
    // to prove the stray duplicate didn't desynchronize anything after.
    let descriptor = DeviceDescriptor::find_by_name("PIC18F66J60").unwrap();
    let fake = UdpSocket::bind(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)).unwrap();
    fake.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let fake_addr = fake.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let mut buf = [0u8; 64];

        // First attempt: received and silently dropped.
        let (_n, _from) = fake.recv_from(&mut buf).unwrap();
        let seq = buf[1];

        // Retry of the same logical operation must carry the same seq.
        let (_n, from) = fake.recv_from(&mut buf).unwrap();
        assert_eq!(buf[1], seq, "retry must reuse the original sequence number");

        let mut reply = [0u8; HEADER_LEN + DiscoverReply::LEN];
        reply[0] = VERSION;
        reply[1] = seq;
        reply[2] = Operation::Discover as u8;
        reply[3] = Status::Ok as u8;
        let payload = DiscoverReply {
            version: 0x0100,
            device_id: descriptor.dev_id << 5,
            bootloader_address: 0xDEADBEEF,
        };
        payload.encode(&mut reply[HEADER_LEN..]);
        // Respond twice with byte-identical frames; the second is a
        // stale duplicate the client must ignore.
        fake.send_to(&reply, from).unwrap();
        fake.send_to(&reply, from).unwrap();

        // A following logical operation (reset) must get a fresh,
        // incremented sequence number untouched by the earlier duplicate.
        let (_n, from2) = fake.recv_from(&mut buf).unwrap();
        assert_eq!(
            buf[1],
            seq.wrapping_add(1),
            "the next logical operation bumps the sequence by exactly one"
        );
        let mut reset_reply = [0u8; HEADER_LEN];
        reset_reply[0] = VERSION;
        reset_reply[1] = buf[1];
        reset_reply[2] = Operation::Reset as u8;
        reset_reply[3] = Status::Ok as u8;
        fake.send_to(&reset_reply, from2).unwrap();
    });

    let mut programmer = bind_programmer();
    let info = programmer
        .connect_device(v4(fake_addr), fake_addr.port())
        .expect("succeeds once the retry gets through");
    assert_eq!(info.bootloader_address, 0xDEADBEEF);

    programmer.reset().expect("reset unaffected by the earlier duplicate");

    handle.join().unwrap();
}

#[test]
fn checksum_matches_written_bytes() {
    let descriptor = DeviceDescriptor::find_by_name("PIC18F66J60").unwrap();
    let (_target, addr) = spawn_target(descriptor);

    let mut programmer = bind_programmer();
    programmer
        .connect_device(v4(addr), addr.port())
        .expect("connect to simulated bootloader");

    let mut image = Image::new();
    image.add(0x40, &[1, 2, 3, 4]).unwrap();
    programmer
        .program(&image, descriptor, |_| {})
        .expect("program image");

    let checksum = programmer.checksum(0x40, 4).unwrap();
    assert_eq!(checksum, 1 + 2 + 3 + 4);
}

#[test]
fn unreachable_peer_does_not_hang() {
    // Nothing is listening on this address; the client must give up
    // after exhausting its retry budget rather than block forever. Some
    // platforms surface this as an explicit connection-refused I/O error
    // instead of a clean timeout, so either is an acceptable outcome here;
    // the property under test is that the call returns at all.
    let mut programmer = bind_programmer();
    let dead = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 1);
    let err = programmer
        .connect_device(v4(dead), dead.port())
        .unwrap_err();
    assert!(matches!(err, Error::Timeout | Error::Io(_)));
}

#[test]
fn misaligned_write_is_rejected_before_any_frame_is_sent() {
    let descriptor = DeviceDescriptor::find_by_name("PIC18F66J60").unwrap();
    let (_target, addr) = spawn_target(descriptor);

    let mut programmer = bind_programmer();
    programmer
        .connect_device(v4(addr), addr.port())
        .expect("connect to simulated bootloader");

    // Unaligned address.
    let err = programmer
        .write_sector(0x0401, vec![0xAAu8; descriptor.write_size as usize])
        .unwrap_err();
    assert!(matches!(err, Error::Unaligned(_)));

    // Aligned address but a short buffer.
    let err = programmer
        .write_sector(0x0400, vec![0xAAu8; descriptor.write_size as usize - 1])
        .unwrap_err();
    assert!(matches!(err, Error::Unaligned(_)));

    // The target never saw either request: a well-formed write to the
    // same page still goes through cleanly afterwards.
    programmer
        .write_sector(0x0400, vec![0xAAu8; descriptor.write_size as usize])
        .expect("aligned write still succeeds");
}

#[test]
fn misaligned_erase_is_rejected_before_any_frame_is_sent() {
    let descriptor = DeviceDescriptor::find_by_name("PIC18F66J60").unwrap();
    let (_target, addr) = spawn_target(descriptor);

    let mut programmer = bind_programmer();
    programmer
        .connect_device(v4(addr), addr.port())
        .expect("connect to simulated bootloader");

    let err = programmer.erase(0x0401).unwrap_err();
    assert!(matches!(err, Error::Unaligned(_)));

    programmer.erase(0x0400).expect("aligned erase still succeeds");
}

#[test]
fn oversized_read_is_rejected_before_any_frame_is_sent() {
    let descriptor = DeviceDescriptor::find_by_name("PIC18F66J60").unwrap();
    let (_target, addr) = spawn_target(descriptor);

    let mut programmer = bind_programmer();
    programmer
        .connect_device(v4(addr), addr.port())
        .expect("connect to simulated bootloader");

    let err = programmer.read(0, u16::MAX).unwrap_err();
    assert!(matches!(err, Error::OutOfRange(_)));
}

#[test]
fn checksum_past_flash_size_is_rejected_before_any_frame_is_sent() {
    let descriptor = DeviceDescriptor::find_by_name("PIC18F66J60").unwrap();
    let (_target, addr) = spawn_target(descriptor);

    let mut programmer = bind_programmer();
    programmer
        .connect_device(v4(addr), addr.port())
        .expect("connect to simulated bootloader");

    let err = programmer
        .checksum(descriptor.flash_size - 2, 4)
        .unwrap_err();
    assert!(matches!(err, Error::OutOfRange(_)));
}

#[test]
fn write_past_flash_size_is_rejected_by_planner() {
    let descriptor = DeviceDescriptor::find_by_name("PIC18F66J60").unwrap();
    let (_target, addr) = spawn_target(descriptor);

    let mut programmer = bind_programmer();
    programmer
        .connect_device(v4(addr), addr.port())
        .expect("connect to simulated bootloader");

    let mut image = Image::new();
    image.add(descriptor.flash_size, &[1, 2, 3]).unwrap();

    let err = programmer
        .program(&image, descriptor, |_| {})
        .unwrap_err();
    assert!(matches!(err, Error::OutOfRange(_)));
}
