pub(crate) mod tiled_attention;

use candle::Device;

pub(crate) trait BenchDevice {
    fn bench_name<S: Into<String>>(&self, name: S) -> String;
}

impl BenchDevice for Device {
    fn bench_name<S: Into<String>>(&self, name: S) -> String {
        match self {
            Device::Cpu => format!("cpu_{}", name.into()),
            _ => name.into(),
        }
    }
}
