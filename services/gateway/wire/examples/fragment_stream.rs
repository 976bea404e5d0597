//! Fragmenting a payload and reading it back.

use gateway_wire::{
    encode_ack, encode_fin, BufferSource, FinCode, Frame, Packetizer, Poll,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Pouch Wire Example ===\n");

    // 1. Fragment a payload for a 23-byte ATT MTU (20 bytes per notification)
    println!("1. Fragmenting a 64-byte payload at capacity 20...");
    let payload: Vec<u8> = (0u8..64).collect();
    let mut packetizer = Packetizer::new(BufferSource::new(payload.clone()));

    let mut frames = Vec::new();
    let mut seq = 0u32;
    while !packetizer.finished() {
        if let Poll::Ready(fragment) = packetizer.next_fragment(20)? {
            println!(
                "   seq {:2} first={} last={} {} bytes",
                seq % 16,
                fragment.first,
                fragment.last,
                fragment.payload.len()
            );
            frames.push(fragment.encode(seq));
            seq += 1;
        }
    }
    frames.push(encode_fin(seq, FinCode::Ok));

    // 2. Decode and reassemble
    println!("\n2. Decoding...");
    let mut reassembled = Vec::new();
    for raw in &frames {
        match Frame::decode(raw)? {
            Frame::Data { payload, .. } => reassembled.extend_from_slice(&payload),
            Frame::Fin { seq, code } => println!("   FIN seq {} code {:?}", seq, code),
            other => println!("   control {:?}", other),
        }
    }
    assert_eq!(reassembled, payload);
    println!("   Reassembled {} bytes", reassembled.len());

    // 3. The receiver's acknowledgment
    println!("\n3. Cumulative ACK for the FIN...");
    let ack = Frame::decode(&encode_ack(seq, 4))?;
    println!("   {:?}", ack);

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
