//! Two tasks and a pipe on the simulated machine.
//!
//! ```sh
//! RUST_LOG=info cargo run --example hello
//! ```
use std::sync::OnceLock;

use teal_kernel::{task, Pipe};

static PIPE: OnceLock<Pipe> = OnceLock::new();

fn producer() {
    let pipe = *PIPE.get().unwrap();
    for message in [b"hello".as_slice(), b"from".as_slice(), b"teal!".as_slice()] {
        pipe.write(&[message.len() as u8]).unwrap();
        pipe.write(message).unwrap();
        task::delay(100);
    }
    pipe.write(&[0]).unwrap();
    loop {
        task::wfi();
    }
}

fn consumer() {
    let pipe = *PIPE.get().unwrap();
    loop {
        let mut len = [0u8; 1];
        pipe.read(&mut len).unwrap();
        if len[0] == 0 {
            break;
        }
        let mut buf = vec![0u8; len[0] as usize];
        pipe.read(&mut buf).unwrap();
        println!("consumer: {}", String::from_utf8_lossy(&buf));
    }
    println!("consumer: done after {} ticks", teal_kernel::ticks());
    teal_kernel::shutdown();
}

fn app_main() -> bool {
    PIPE.set(Pipe::new(16).unwrap()).unwrap();
    task::spawn(producer, 8192);
    task::spawn(consumer, 8192);
    true // preemptive
}

fn main() {
    teal_port_std::run(app_main);
}
