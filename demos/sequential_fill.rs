use blockcache::{Cache, Whence};

fn main() {
    env_logger::init();

    let path = std::env::temp_dir().join("blockcache-demo-sequential-fill.bin");
    let mut cache = Cache::new().expect("init");

    let fd = cache
        .open(&path, libc::O_RDWR | libc::O_CREAT)
        .expect("open");

    // Fill the file with 1024 blocks, each stamped with a rotating letter so a
    // re-read can sanity-check which block landed where.
    let block_size = blockcache::granularity();
    for i in 0u8..1024 {
        let byte = b'A' + (i % 26);
        cache.write(fd, &vec![byte; block_size]).expect("write");
    }

    let stats = cache.stats();
    println!(
        "wrote 1024 blocks: {} resident, {} hits, {} misses",
        stats.resident, stats.hits, stats.misses
    );

    // Re-read the first few blocks; with capacity 100 they will have long
    // since been evicted, so expect misses here despite having just written
    // them.
    cache.seek(fd, 0, Whence::Set).expect("seek");
    let mut buf = vec![0u8; block_size];
    cache.read(fd, &mut buf).expect("read");
    println!("block 0 starts with {:?}", buf[0] as char);

    cache.close(fd).expect("close");
    let _ = std::fs::remove_file(&path);
}
