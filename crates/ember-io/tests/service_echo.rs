//! 网络服务端到端：multishot accept/recv、按需消费与发送合并的回显闭环。
//!
//! 内核或沙箱不具备所需 io_uring 能力时（容器内常被 seccomp 拦截），
//! 用例探测后直接跳过，不计失败。

#![cfg(target_os = "linux")]

use bytes::BytesMut;
use ember_core::{Task, ThreadPoolExecutor, ThreadPoolExecutorOptions};
use ember_io::{NetworkIoService, NetworkServiceOptions, ServiceError};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::IntoRawFd;
use std::sync::mpsc;
use std::time::Duration;

fn io_uring_supported() -> bool {
    let Ok(ring) = io_uring::IoUring::new(8) else {
        return false;
    };
    let mut probe = io_uring::Probe::new();
    if ring.submitter().register_probe(&mut probe).is_err() {
        return false;
    }
    probe.is_supported(io_uring::opcode::PollAdd::CODE)
        && probe.is_supported(io_uring::opcode::AcceptMulti::CODE)
        && probe.is_supported(io_uring::opcode::RecvMulti::CODE)
        && probe.is_supported(io_uring::opcode::Send::CODE)
}

#[test]
fn start_without_executor_is_rejected() {
    let service = NetworkIoService::new();
    assert!(matches!(
        service.start(),
        Err(ServiceError::MissingExecutor)
    ));
}

#[test]
fn operations_before_start_report_not_started() {
    let service = NetworkIoService::new();
    assert!(matches!(service.accept(0), Err(ServiceError::NotStarted)));
    assert!(matches!(
        service.send(ember_io::SocketId::new(1, 0), bytes::Bytes::from_static(b"x")),
        Err(ServiceError::NotStarted)
    ));
    assert!(matches!(service.stop(), Err(ServiceError::NotStarted)));
}

#[test]
fn echo_round_trip_over_io_uring() {
    if !io_uring_supported() {
        eprintln!("跳过：当前内核或沙箱不支持所需的 io_uring 能力");
        return;
    }

    let pool = ThreadPoolExecutor::start(
        ThreadPoolExecutorOptions::new()
            .with_worker_number(4)
            .with_global_capacity(1024)
            .with_local_capacity(256),
    );
    let service: &'static NetworkIoService = Box::leak(Box::new(NetworkIoService::new()));
    service.set_executor(pool.clone());
    service.set_options(
        NetworkServiceOptions::new()
            .with_ring_capacity(256)
            .with_buffer_ring_capacity(64),
    );

    let (accept_sender, accept_receiver) = mpsc::channel();
    service.set_on_accept(move |socket_id| {
        accept_sender.send(socket_id).ok();
    });
    service.set_on_receive(move |socket_id, cord, _finished| {
        let data = cord.to_bytes();
        cord.clear();
        Task::new(async move {
            if !data.is_empty() {
                let mut reply = BytesMut::from(&b"echo:"[..]);
                reply.extend_from_slice(&data);
                service
                    .send(socket_id, reply.freeze())
                    .expect("回显发送不应失败");
            }
        })
    });
    service.set_on_error(|socket_id, error| {
        eprintln!("on_error: {socket_id} {error}");
    });
    service.start().expect("服务启动失败");

    let listener =
        Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).expect("创建监听套接字失败");
    listener
        .set_reuse_address(true)
        .expect("设置 SO_REUSEADDR 失败");
    let bind_addr: SocketAddr = "127.0.0.1:0".parse().expect("监听地址字面量合法");
    listener.bind(&bind_addr.into()).expect("绑定本地监听失败");
    listener.listen(128).expect("进入监听状态失败");
    let address = listener
        .local_addr()
        .expect("读取监听地址失败")
        .as_socket()
        .expect("监听地址必然是 IP 套接字");
    let listen_fd = listener.into_raw_fd();
    service.accept(listen_fd).expect("托管监听套接字失败");

    let mut client = TcpStream::connect(address).expect("连接服务失败");
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("设置读超时失败");
    client.write_all(b"ping").expect("发送请求失败");

    let expected = b"echo:ping";
    let mut received = Vec::new();
    let mut buffer = [0u8; 64];
    while received.len() < expected.len() {
        match client.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => received.extend_from_slice(&buffer[..read]),
            Err(error) => panic!("读取回显失败: {error}"),
        }
    }
    assert_eq!(&expected[..], &received[..], "回显内容必须逐字节一致");
    accept_receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("on_accept 必须被调用");

    drop(client);
    service.stop().expect("停机失败");
    pool.stop();
    // SAFETY: 监听 fd 已不再被服务引用。
    unsafe {
        libc::close(listen_fd);
    }
}
