#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BitReaderError {
    #[error("tried to read past the end of the bitstream")]
    EndOfStream,

    #[error("exp-golomb code with more than 32 leading zero bits")]
    MalformedExpGolomb,

    #[error("exp-golomb code does not fit the target type")]
    ExpGolombOutOfRange,

    #[error("byte read at a position that is not byte-aligned")]
    NotByteAligned,
}

/// MSB-first bit cursor over an immutable byte window, with the Exp-Golomb
/// primitives used throughout the H.264 syntax.
pub struct BitReader<'a> {
    data: &'a [u8],
    byte_pos: usize,
    bit_pos: u8,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte_pos: 0,
            bit_pos: 0,
        }
    }

    pub fn read_bit(&mut self) -> Result<u8, BitReaderError> {
        let byte = *self
            .data
            .get(self.byte_pos)
            .ok_or(BitReaderError::EndOfStream)?;

        let bit = (byte >> (7 - self.bit_pos)) & 1;

        self.bit_pos += 1;
        if self.bit_pos == 8 {
            self.bit_pos = 0;
            self.byte_pos += 1;
        }

        Ok(bit)
    }

    pub fn read_flag(&mut self) -> Result<bool, BitReaderError> {
        Ok(self.read_bit()? == 1)
    }

    /// Reads `n <= 32` bits, MSB first.
    pub fn read_bits(&mut self, n: u32) -> Result<u32, BitReaderError> {
        debug_assert!(n <= 32);

        let mut result = 0u32;
        for _ in 0..n {
            result = (result << 1) | self.read_bit()? as u32;
        }

        Ok(result)
    }

    /// Reads a whole byte. The cursor must be byte-aligned.
    pub fn read_byte(&mut self) -> Result<u8, BitReaderError> {
        if self.bit_pos != 0 {
            return Err(BitReaderError::NotByteAligned);
        }

        let byte = *self
            .data
            .get(self.byte_pos)
            .ok_or(BitReaderError::EndOfStream)?;
        self.byte_pos += 1;

        Ok(byte)
    }

    /// ue(v) per ITU-T H.264 §9.1.
    pub fn read_unsigned_exp_golomb(&mut self) -> Result<u32, BitReaderError> {
        let mut leading_zeros = 0u32;
        while self.read_bit()? == 0 {
            leading_zeros += 1;
            if leading_zeros > 32 {
                return Err(BitReaderError::MalformedExpGolomb);
            }
        }

        let suffix = if leading_zeros == 0 {
            0
        } else {
            let mut bits = 0u64;
            for _ in 0..leading_zeros {
                bits = (bits << 1) | self.read_bit()? as u64;
            }
            bits
        };

        let code_num = (1u64 << leading_zeros) - 1 + suffix;
        u32::try_from(code_num).map_err(|_| BitReaderError::ExpGolombOutOfRange)
    }

    /// se(v) per ITU-T H.264 §9.1.1: code 0 -> 0, 1 -> 1, 2 -> -1, 3 -> 2, ...
    pub fn read_signed_exp_golomb(&mut self) -> Result<i32, BitReaderError> {
        let code_num = self.read_unsigned_exp_golomb()? as i64;

        let value = if code_num % 2 == 0 {
            -(code_num / 2)
        } else {
            (code_num + 1) / 2
        };

        i32::try_from(value).map_err(|_| BitReaderError::ExpGolombOutOfRange)
    }

    pub fn has_more_data(&self) -> bool {
        self.byte_pos < self.data.len()
    }

    /// True while bits other than the RBSP stop bit and its zero padding remain
    /// past the cursor.
    pub fn has_more_rbsp_data(&self) -> bool {
        if !self.has_more_data() {
            return false;
        }

        // The stop bit is the last set bit in the window; everything after it
        // is padding.
        let Some((idx, byte)) = self
            .data
            .iter()
            .enumerate()
            .rev()
            .find(|(_, byte)| **byte != 0)
        else {
            return false;
        };

        let stop_bit = idx * 8 + (7 - byte.trailing_zeros() as usize);
        self.position_in_bits() < stop_bit
    }

    pub fn position_in_bits(&self) -> usize {
        self.byte_pos * 8 + self.bit_pos as usize
    }
}
