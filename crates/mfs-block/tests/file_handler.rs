#![forbid(unsafe_code)]

use mfs_block::{
    BlockBuffer, BufferedOperation, ByteBlockDevice, FileByteDevice, Operation, TransactionHandler,
    DeviceTransactionHandler,
};

#[test]
fn handler_persists_to_file_image() {
    let image = tempfile::NamedTempFile::new().expect("tempfile");
    image.as_file().set_len(16 * 4096).expect("set_len");

    {
        let dev = ByteBlockDevice::new(FileByteDevice::open(image.path()).expect("open"), 4096)
            .expect("block device");
        let handler = DeviceTransactionHandler::new(dev).expect("handler");
        let buf = BlockBuffer::new(2, handler.block_size());
        buf.write_blocks(0, &[0xAB_u8; 8192]).expect("fill");
        handler
            .run_requests(&[BufferedOperation {
                buffer: buf,
                op: Operation::write(0, 14, 2),
            }])
            .expect("write");
        handler.flush().expect("flush");
    }

    let dev = ByteBlockDevice::new(FileByteDevice::open(image.path()).expect("reopen"), 4096)
        .expect("block device");
    let handler = DeviceTransactionHandler::new(dev).expect("handler");
    assert_eq!(handler.block_count(), 16);
    let back = BlockBuffer::new(2, handler.block_size());
    handler
        .run_requests(&[BufferedOperation {
            buffer: back.clone(),
            op: Operation::read(0, 14, 2),
        }])
        .expect("read");
    assert_eq!(back.read_blocks(0, 2).expect("blocks"), vec![0xAB_u8; 8192]);
}
