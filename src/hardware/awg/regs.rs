//! Spectrum M2i/M4i register numbers and flag values used by the AWG driver.

#![allow(missing_docs)]

pub const ERR_OK: u32 = 0;

// Card identification
pub const SPC_PCISERIALNO: i32 = 2030;
pub const SPC_MIINST_BYTESPERSAMPLE: i32 = 1122;

// Commands and status
pub const SPC_M2CMD: i32 = 100;
pub const M2CMD_CARD_RESET: i32 = 0x0000_0001;
pub const M2CMD_CARD_WRITESETUP: i32 = 0x0000_0002;
pub const M2CMD_CARD_START: i32 = 0x0000_0004;
pub const M2CMD_CARD_ENABLETRIGGER: i32 = 0x0000_0008;
pub const M2CMD_CARD_FORCETRIGGER: i32 = 0x0000_0010;
pub const M2CMD_CARD_DISABLETRIGGER: i32 = 0x0000_0020;
pub const M2CMD_CARD_STOP: i32 = 0x0000_0040;
pub const M2CMD_CARD_WAITTRIGGER: i32 = 0x0000_2000;
pub const M2CMD_CARD_WAITREADY: i32 = 0x0000_4000;
pub const M2CMD_DATA_STARTDMA: i32 = 0x0001_0000;
pub const M2CMD_DATA_WAITDMA: i32 = 0x0002_0000;

pub const SPC_M2STATUS: i32 = 110;
pub const M2STAT_CARD_TRIGGER: i32 = 0x0000_0002;
pub const M2STAT_CARD_READY: i32 = 0x0000_0004;
pub const M2STAT_DATA_END: i32 = 0x0000_0200;
pub const M2STAT_DATA_OVERRUN: i32 = 0x0000_0400;
pub const M2STAT_DATA_ERROR: i32 = 0x0000_0800;

pub const SPC_TIMEOUT: i32 = 295130;

// Memory and replay mode
pub const SPC_MEMSIZE: i32 = 10000;
pub const SPC_SEGMENTSIZE: i32 = 10010;
pub const SPC_LOOPS: i32 = 10020;

pub const SPC_CARDMODE: i32 = 9500;
pub const SPC_REP_STD_SINGLE: i32 = 0x0000_0100;
pub const SPC_REP_STD_MULTI: i32 = 0x0000_0200;
pub const SPC_REP_STD_GATE: i32 = 0x0000_0400;
pub const SPC_REP_FIFO_SINGLE: i32 = 0x0000_0800;
pub const SPC_REP_FIFO_MULTI: i32 = 0x0000_1000;
pub const SPC_REP_FIFO_GATE: i32 = 0x0000_2000;
pub const SPC_REP_STD_CONTINUOUS: i32 = 0x0000_4000;
pub const SPC_REP_STD_SINGLERESTART: i32 = 0x0000_8000;
pub const SPC_REP_STD_SEQUENCE: i32 = 0x0004_0000;

// Sequence memory
pub const SPC_SEQMODE_STEPMEM0: i32 = 340000;
pub const SPC_SEQMODE_MAXSEGMENTS: i32 = 349910;
pub const SPC_SEQMODE_WRITESEGMENT: i32 = 349920;
pub const SPC_SEQMODE_STARTSTEP: i32 = 349930;
pub const SPC_SEQMODE_SEGMENTSIZE: i32 = 349940;

pub const SPCSEQ_ENDLOOPALWAYS: i64 = 0x0000_0000;
pub const SPCSEQ_ENDLOOPONTRIG: i64 = 0x4000_0000;
pub const SPCSEQ_END: i64 = 0x8000_0000;

// Channels
pub const SPC_CHENABLE: i32 = 11000;
pub const SPC_CHCOUNT: i32 = 11001;

pub const SPC_OFFS0: [i32; 4] = [30000, 30100, 30200, 30300];
pub const SPC_AMP0: [i32; 4] = [30010, 30110, 30210, 30310];
pub const SPC_FILTER0: [i32; 4] = [30080, 30180, 30280, 30380];
pub const SPC_ENABLEOUT0: [i32; 4] = [30091, 30191, 30291, 30391];
pub const SPC_CH0_STOPLEVEL: [i32; 4] = [206020, 206021, 206022, 206023];

pub const SPCM_STOPLVL_LOW: i32 = 0x0000_0002;
pub const SPCM_STOPLVL_HIGH: i32 = 0x0000_0004;
pub const SPCM_STOPLVL_HOLDLAST: i32 = 0x0000_0008;
pub const SPCM_STOPLVL_ZERO: i32 = 0x0000_0010;

// Clock
pub const SPC_SAMPLERATE: i32 = 20000;
pub const SPC_CLOCKMODE: i32 = 20200;
pub const SPC_CM_INTPLL: i32 = 0x0000_0001;

// Trigger
pub const SPC_TRIG_TERM: i32 = 40110;
pub const SPC_TRIG_ORMASK: i32 = 40410;
pub const SPC_TMASK_EXT0: i32 = 0x0000_0002;
pub const SPC_TMASK_EXT1: i32 = 0x0000_0004;
pub const SPC_TRIG_CH_ORMASK0: i32 = 40460;
pub const SPC_TRIG_EXT_MODE: [i32; 2] = [40510, 40511];
pub const SPC_TRIG_EXT_LEVEL0: [i32; 2] = [42320, 42321];
pub const SPC_TM_POS: i32 = 0x0000_0001;
pub const SPC_TM_NEG: i32 = 0x0000_0002;

// Multi-purpose lines (markers)
pub const SPCM_X0_MODE: i32 = 47200;
pub const SPCM_X1_MODE: i32 = 47201;
pub const SPCM_X2_MODE: i32 = 47202;
pub const SPCM_XMODE_DISABLE: i32 = 0x0000_0000;
pub const SPCM_XMODE_DIGOUT: i32 = 0x0000_0020;
pub const SPCM_XMODE_DIGOUTSRC_CH0: i32 = 0x0100_0000;
pub const SPCM_XMODE_DIGOUTSRC_CH1: i32 = 0x0200_0000;
pub const SPCM_XMODE_DIGOUTSRC_BIT15: i32 = 0x0001_0000;
pub const SPCM_XMODE_DIGOUTSRC_BIT14: i32 = 0x0002_0000;

// Star-hub
pub const SPC_SYNC_READ_SYNCCOUNT: i32 = 48990;
pub const SPC_SYNC_READ_CARDIDX: [i32; 4] = [49000, 49001, 49002, 49003];
pub const SPC_SYNC_ENABLEMASK: i32 = 49200;
