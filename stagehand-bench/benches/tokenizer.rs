use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use stagehand_core::Tokenizer;

// control ids, 256 byte pieces, then ascii letters and a ladder of merges
fn synthetic_vocab() -> Tokenizer {
    let mut pieces: Vec<(Vec<u8>, f32)> = vec![
        (b"<unk>".to_vec(), 0.0),
        (b"<s>".to_vec(), 0.0),
        (b"</s>".to_vec(), 0.0),
    ];
    for b in 0..=255u8 {
        pieces.push((format!("<0x{b:02X}>").into_bytes(), 0.0));
    }
    for c in (b'a'..=b'z').chain([b' ']) {
        pieces.push((vec![c], -10.0));
    }
    for word in ["the", "quick", "brown", "fox", "jumps", "over", "lazy", "dog"] {
        let spaced = format!(" {word}");
        for end in 2..=spaced.len() {
            pieces.push((spaced[..end].as_bytes().to_vec(), -(end as f32)));
        }
    }
    Tokenizer::from_pieces(pieces, 1, 2)
}

fn encode_benchmark(c: &mut Criterion) {
    let tok = synthetic_vocab();
    let text = " the quick brown fox jumps over the lazy dog".repeat(16);
    c.bench_function("encode_700b", |b| {
        b.iter(|| tok.encode(black_box(&text), 1, 1))
    });

    let mixed = "naïve café 日本語 🚀 ".repeat(16);
    c.bench_function("encode_byte_fallback", |b| {
        b.iter(|| tok.encode(black_box(&mixed), 1, 1))
    });
}

fn decode_benchmark(c: &mut Criterion) {
    let tok = synthetic_vocab();
    let ids = tok.encode(&" the quick brown fox jumps over the lazy dog".repeat(16), 1, 1);
    c.bench_function("decode_all", |b| b.iter(|| tok.decode_all(black_box(&ids))));
}

criterion_group!(benches, encode_benchmark, decode_benchmark);
criterion_main!(benches);
