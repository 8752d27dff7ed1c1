//! Thread de transporte que lê bytes crus e envia para o loop principal via channel.

use crossbeam_channel::{Receiver, Sender, bounded};
use std::io::{ErrorKind, Read};
use tracing::{debug, info, warn};

/// Tamanho de cada leitura.
const CHUNK_SIZE: usize = 4096;

/// Inicia a thread de leitura. O channel fecha no EOF.
pub fn spawn_reader_thread<R>(input: R) -> std::io::Result<Receiver<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = bounded::<Vec<u8>>(64); // Buffer de 64 chunks

    std::thread::Builder::new()
        .name("transport-reader".into())
        .spawn(move || reader_loop(input, &tx))?;

    Ok(rx)
}

fn reader_loop(mut input: impl Read, tx: &Sender<Vec<u8>>) {
    let mut buf = [0u8; CHUNK_SIZE];
    let mut total = 0usize;

    loop {
        match input.read(&mut buf) {
            Ok(0) => {
                info!("Fim do transporte ({total} bytes lidos)");
                break;
            }
            Ok(n) => {
                total += n;
                // Bloqueante: bytes do protocolo não podem ser descartados
                if tx.send(buf[..n].to_vec()).is_err() {
                    debug!("Loop principal encerrado, parando leitura");
                    break;
                }
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("Erro ao ler transporte: {e}");
                break;
            }
        }
    }
}
