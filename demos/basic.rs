use osmem::{OsMem, Reserved};

fn log_alloc(addr: *mut u8, size: usize) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {addr:?}");
}

fn main() {
    let mut osmem = OsMem::with_kernel(Reserved::with_capacity(1 << 26));

    let addr1 = osmem.allocate(8);
    log_alloc(addr1, 8);

    let addr2 = osmem.allocate(4000);
    log_alloc(addr2, 4000);

    let addr3 = osmem.allocate(200_000);
    log_alloc(addr3, 200_000);

    println!("{:?}", osmem.stats());

    unsafe {
        osmem.release(addr2);

        let addr4 = osmem.allocate(2000);
        println!("Should be the second address: {addr4:?}");

        let addr5 = osmem.resize(addr1, 16);
        println!("Resized to: {addr5:?}");

        osmem.release(addr3);
        osmem.release(addr4);
        osmem.release(addr5);
    }

    println!("{:?}", osmem.stats());
}
