//! Protocolo serial PX100 usado pela carga eletrônica DL24P.
//!
//! Formato dos frames:
//!
//! ```text
//! Comando (6 bytes)
//! ┌──────┬──────┬─────┬────┬────┬──────┐
//! │ 0xB1 │ 0xB2 │ CMD │ D1 │ D2 │ 0xB6 │
//! └──────┴──────┴─────┴────┴────┴──────┘
//!
//! Resposta (8 bytes)
//! ┌──────┬──────┬─────┬────┬────┬────┬──────┬──────┐
//! │ 0xCA │ 0xCB │ CMD │ D1 │ D2 │ D3 │ 0xCE │ 0xCF │
//! └──────┴──────┴─────┴────┴────┴────┴──────┴──────┘
//! ```
//!
//! - `D1..D3` da resposta formam um valor big-endian de 24 bits
//! - Setters parametrizados usam ponto fixo: `D1 = parte inteira`,
//!   `D2 = centésimos`
//! - Falhas de decodificação não são erros: retornam `None` e o chamador
//!   continua alimentando bytes

use num_enum::{FromPrimitive, IntoPrimitive};
use tracing::debug;

/// Header fixo dos comandos enviados à carga.
pub const CMD_HEADER: [u8; 2] = [0xB1, 0xB2];

/// Trailer fixo dos comandos.
pub const CMD_TRAILER: u8 = 0xB6;

/// Header fixo das respostas da carga.
pub const RSP_HEADER: [u8; 2] = [0xCA, 0xCB];

/// Trailer fixo das respostas.
pub const RSP_TRAILER: [u8; 2] = [0xCE, 0xCF];

/// Tamanho de um frame de comando.
pub const COMMAND_LEN: usize = 6;

/// Tamanho de um frame de resposta.
pub const RESPONSE_LEN: usize = 8;

/// Frame de comando pronto para o transporte.
pub type CommandFrame = [u8; COMMAND_LEN];

/// Frame de resposta candidato extraído do stream (ainda não validado).
pub type ResponsePacket = [u8; RESPONSE_LEN];

/// Códigos de comando do PX100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum Command {
    /// `D1 = 1` liga a carga, `D1 = 0` desliga
    OnOff = 0x01,
    SetCurrent = 0x02,
    SetCutoff = 0x03,
    /// Zera os contadores de capacidade/energia
    Reset = 0x05,

    // Consultas – a resposta chega no formato CA CB
    GetOnOff = 0x10,
    /// Resposta em mV
    GetVoltage = 0x11,
    /// Resposta em mA
    GetCurrent = 0x12,
    /// Resposta em mAh
    GetCapacity = 0x14,
    /// Resposta em mWh
    GetEnergy = 0x15,
    /// Resposta em °C
    GetTemperature = 0x16,
    GetSetCurrent = 0x17,
    GetCutoff = 0x18,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Resposta decodificada por [`parse_response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseRecord {
    pub cmd: u8,
    pub d1: u8,
    pub d2: u8,
    pub d3: u8,
    /// `(d1 << 16) | (d2 << 8) | d3`
    pub raw_value: u32,
}

impl ResponseRecord {
    /// Comando ao qual esta resposta se refere.
    pub fn command(&self) -> Command {
        Command::from(self.cmd)
    }

    /// Interpreta `D1.D2` como ponto fixo (leituras de corrente/cutoff configurados).
    pub fn fixed_point(&self) -> f64 {
        decode_fixed_point(self.d1, self.d2)
    }
}

// ──────────────────────────────────────────────
// Encoding
// ──────────────────────────────────────────────

/// Monta um frame de comando: `[B1, B2, cmd, d1, d2, B6]`.
pub fn build_command(cmd: impl Into<u8>, d1: u8, d2: u8) -> CommandFrame {
    [CMD_HEADER[0], CMD_HEADER[1], cmd.into(), d1, d2, CMD_TRAILER]
}

/// Consulta sem payload (`D1 = D2 = 0`).
pub fn cmd_query(cmd: Command) -> CommandFrame {
    build_command(cmd, 0x00, 0x00)
}

pub fn cmd_turn_on() -> CommandFrame {
    build_command(Command::OnOff, 0x01, 0x00)
}

pub fn cmd_turn_off() -> CommandFrame {
    build_command(Command::OnOff, 0x00, 0x00)
}

/// Zera os contadores acumulados da carga.
pub fn cmd_reset() -> CommandFrame {
    build_command(Command::Reset, 0x00, 0x00)
}

/// Define a corrente de descarga em ampères (ex: `1.5` → `D1=1, D2=50`).
pub fn cmd_set_current(current_a: f64) -> CommandFrame {
    let (int_part, dec_part) = encode_fixed_point(current_a);
    build_command(Command::SetCurrent, int_part, dec_part)
}

/// Define a tensão de corte em volts.
pub fn cmd_set_cutoff(voltage: f64) -> CommandFrame {
    let (int_part, dec_part) = encode_fixed_point(voltage);
    build_command(Command::SetCutoff, int_part, dec_part)
}

pub fn cmd_get_on_off() -> CommandFrame {
    cmd_query(Command::GetOnOff)
}

pub fn cmd_get_voltage() -> CommandFrame {
    cmd_query(Command::GetVoltage)
}

pub fn cmd_get_current() -> CommandFrame {
    cmd_query(Command::GetCurrent)
}

/// Divide um decimal em `(parte inteira, centésimos)`.
///
/// A parte inteira é truncada (`floor`) e a fracionária arredondada; cada
/// byte é limitado a `0..=255`. Valores negativos ou não finitos viram `(0, 0)`.
pub fn encode_fixed_point(value: f64) -> (u8, u8) {
    if !value.is_finite() || value <= 0.0 {
        return (0, 0);
    }
    let int_part = value.floor();
    let dec_part = ((value - int_part) * 100.0).round();
    (
        int_part.clamp(0.0, 255.0) as u8,
        dec_part.clamp(0.0, 255.0) as u8,
    )
}

/// Inverso de [`encode_fixed_point`].
pub fn decode_fixed_point(int_part: u8, dec_part: u8) -> f64 {
    f64::from(int_part) + f64::from(dec_part) / 100.0
}

// ──────────────────────────────────────────────
// Decoding
// ──────────────────────────────────────────────

/// Decodifica um frame de resposta.
///
/// Retorna `None` se `data` tiver menos de 8 bytes, se os dois primeiros
/// bytes não forem [`RSP_HEADER`] ou se os dois últimos não forem
/// [`RSP_TRAILER`].
pub fn parse_response(data: &[u8]) -> Option<ResponseRecord> {
    if data.len() < RESPONSE_LEN {
        return None;
    }
    if data[..2] != RSP_HEADER || data[data.len() - 2..] != RSP_TRAILER {
        return None;
    }

    let (cmd, d1, d2, d3) = (data[2], data[3], data[4], data[5]);
    Some(ResponseRecord {
        cmd,
        d1,
        d2,
        d3,
        raw_value: u32::from_be_bytes([0, d1, d2, d3]),
    })
}

fn find_header(buffer: &[u8]) -> Option<usize> {
    buffer.windows(RSP_HEADER.len()).position(|w| w == RSP_HEADER)
}

/// Localiza o próximo frame de resposta candidato no acumulador.
///
/// Retorna `(pacote, restante)`:
/// - sem header: nenhum pacote; o restante é só o último byte (pode ser a
///   primeira metade de um header partido entre duas leituras)
/// - header com frame completo: os 8 bytes a partir do header e o que vem depois
/// - header com frame incompleto: nenhum pacote; o restante é o frame parcial
///
/// Não valida trailer nem comando, isso é papel de [`parse_response`].
pub fn find_response(buffer: &[u8]) -> (Option<ResponsePacket>, &[u8]) {
    let Some(idx) = find_header(buffer) else {
        return (None, &buffer[buffer.len().saturating_sub(1)..]);
    };

    let framed = &buffer[idx..];
    match framed.split_first_chunk::<RESPONSE_LEN>() {
        Some((packet, rest)) => (Some(*packet), rest),
        None => (None, framed),
    }
}

// ──────────────────────────────────────────────
// Acumulador de stream
// ──────────────────────────────────────────────

/// Acumulador de bytes do transporte com extração incremental de frames.
///
/// Dono único: pertence ao loop que lê o transporte.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anexa bytes recém-chegados do transporte.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Extrai o próximo pacote candidato, descartando o ruído antes dele.
    pub fn next_packet(&mut self) -> Option<ResponsePacket> {
        let (packet, rest) = find_response(&self.buf);
        let consumed = self.buf.len() - rest.len();
        let noise = consumed - packet.map_or(0, |p| p.len());
        if noise > 0 {
            debug!("Descartando {noise} bytes de ruído");
        }
        self.buf.drain(..consumed);
        packet
    }

    /// Extrai a próxima resposta válida, pulando pacotes rejeitados.
    pub fn next_record(&mut self) -> Option<ResponseRecord> {
        loop {
            let packet = self.next_packet()?;
            match parse_response(&packet) {
                Some(record) => return Some(record),
                None => debug!("Pacote inválido descartado: {packet:02X?}"),
            }
        }
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn response(cmd: u8, d1: u8, d2: u8, d3: u8) -> ResponsePacket {
        [0xCA, 0xCB, cmd, d1, d2, d3, 0xCE, 0xCF]
    }

    #[test]
    fn build_command_structure() {
        let cmd = build_command(0x01u8, 0x02, 0x03);
        assert_eq!(cmd, [0xB1, 0xB2, 0x01, 0x02, 0x03, 0xB6]);
    }

    #[test]
    fn on_off_commands() {
        assert_eq!(cmd_turn_on(), [0xB1, 0xB2, 0x01, 0x01, 0x00, 0xB6]);
        assert_eq!(cmd_turn_off(), [0xB1, 0xB2, 0x01, 0x00, 0x00, 0xB6]);
        assert_eq!(cmd_reset()[2], 0x05);
        assert_eq!(cmd_get_voltage()[2], 0x11);
    }

    #[yare::parameterized(
        one_and_half   = { 1.5, 1, 50 },
        quarter        = { 0.25, 0, 25 },
        integer        = { 2.0, 2, 0 },
        rounds_up      = { 0.29, 0, 29 },
        near_next_int  = { 1.999, 1, 100 },
        negative       = { -1.0, 0, 0 },
        too_large      = { 300.5, 255, 50 },
    )]
    fn set_current_fixed_point(value: f64, int_byte: u8, dec_byte: u8) {
        let cmd = cmd_set_current(value);
        assert_eq!(cmd[2], 0x02);
        assert_eq!((cmd[3], cmd[4]), (int_byte, dec_byte));
    }

    #[test]
    fn set_cutoff_uses_same_encoding() {
        let cmd = cmd_set_cutoff(3.3);
        assert_eq!(&cmd[2..5], &[0x03, 3, 30]);
    }

    #[test]
    fn nan_encodes_as_zero() {
        assert_eq!(encode_fixed_point(f64::NAN), (0, 0));
    }

    #[test]
    fn parse_valid_response() {
        let record = parse_response(&response(0x11, 0x00, 0x0F, 0xA0)).unwrap();
        assert_eq!(record.command(), Command::GetVoltage);
        assert_eq!(record.raw_value, 4000);
        assert_eq!((record.d1, record.d2, record.d3), (0x00, 0x0F, 0xA0));
    }

    #[test]
    fn parse_is_big_endian_for_every_payload() {
        for d1 in 0..=255u8 {
            for d2 in 0..=255u8 {
                for d3 in 0..=255u8 {
                    let record = parse_response(&response(0x12, d1, d2, d3)).unwrap();
                    let expected = (u32::from(d1) << 16) | (u32::from(d2) << 8) | u32::from(d3);
                    assert_eq!(record.raw_value, expected);
                    assert_eq!(record.cmd, 0x12);
                }
            }
        }
    }

    #[yare::parameterized(
        too_short   = { &[0xCA, 0xCB, 0x11, 0x00, 0x00, 0x00, 0xCE] },
        bad_header  = { &[0xCA, 0xCC, 0x11, 0x00, 0x00, 0x00, 0xCE, 0xCF] },
        bad_trailer = { &[0xCA, 0xCB, 0x11, 0x00, 0x00, 0x00, 0xCE, 0x00] },
        empty       = { &[] },
    )]
    fn parse_rejects(data: &[u8]) {
        assert!(parse_response(data).is_none());
    }

    #[test]
    fn unknown_command_is_preserved() {
        let record = parse_response(&response(0x7E, 0, 0, 1)).unwrap();
        assert_eq!(record.command(), Command::Unknown(0x7E));
    }

    #[test]
    fn find_response_skips_leading_garbage() {
        let frame = response(0x12, 0x00, 0x01, 0xF4);
        let mut buffer = vec![0x00, 0x13, 0xCA, 0x42];
        buffer.extend_from_slice(&frame);
        buffer.extend_from_slice(&[0x99, 0x98]);

        let (packet, rest) = find_response(&buffer);
        assert_eq!(packet, Some(frame));
        assert_eq!(rest, &[0x99, 0x98]);
    }

    #[test]
    fn find_response_keeps_last_byte_without_header() {
        let (packet, rest) = find_response(&[0xCA]);
        assert!(packet.is_none());
        assert_eq!(rest, &[0xCA]);

        let (packet, rest) = find_response(&[0x01, 0x02, 0x03]);
        assert!(packet.is_none());
        assert_eq!(rest, &[0x03]);

        let (packet, rest) = find_response(&[]);
        assert!(packet.is_none());
        assert!(rest.is_empty());
    }

    #[test]
    fn find_response_keeps_partial_frame() {
        let buffer = [0x55, 0xCA, 0xCB, 0x11, 0x00];
        let (packet, rest) = find_response(&buffer);
        assert!(packet.is_none());
        assert_eq!(rest, &[0xCA, 0xCB, 0x11, 0x00]);
    }

    #[test]
    fn frame_buffer_drains_back_to_back_frames() {
        let mut fb = FrameBuffer::new();
        fb.extend(&response(0x11, 0, 0x0F, 0xA0));
        fb.extend(&response(0x12, 0, 0x01, 0xF4));

        assert_eq!(fb.next_record().map(|r| r.raw_value), Some(4000));
        assert_eq!(fb.next_record().map(|r| r.raw_value), Some(500));
        assert!(fb.next_record().is_none());
        assert!(fb.is_empty());
    }

    #[test]
    fn frame_buffer_joins_split_reads() {
        let frame = response(0x16, 0, 0, 35);
        let mut fb = FrameBuffer::new();

        fb.extend(&[0x00, 0xCA]);
        assert!(fb.next_record().is_none());
        assert_eq!(fb.len(), 1);

        fb.extend(&frame[1..5]);
        assert!(fb.next_record().is_none());

        fb.extend(&frame[5..]);
        assert_eq!(fb.next_record().map(|r| r.raw_value), Some(35));
    }

    #[test]
    fn frame_buffer_skips_corrupted_frame() {
        let mut fb = FrameBuffer::new();
        fb.extend(&[0xCA, 0xCB, 0x11, 0x00, 0x00, 0x01, 0xDE, 0xAD]);
        fb.extend(&response(0x10, 0, 0, 1));

        let record = fb.next_record().unwrap();
        assert_eq!(record.command(), Command::GetOnOff);
        assert!(fb.is_empty());
    }
}
