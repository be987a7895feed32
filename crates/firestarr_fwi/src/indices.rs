//! The individual index equations.

/// Moisture constant for the hourly FFMC conversion.
const FFMC_COEFFICIENT: f64 = 147.277_23;

/// Day-length factors for DMC drying, by month (1-12).
const DAY_LENGTH_DMC: [f64; 12] = [
    6.5, 7.5, 9.0, 12.8, 13.9, 13.9, 12.4, 10.9, 9.4, 8.0, 7.0, 6.0,
];

/// Day-length adjustments for DC drying, by month (1-12).
const DAY_LENGTH_DC: [f64; 12] = [
    -1.6, -1.6, -1.6, 0.9, 3.8, 5.8, 6.4, 5.0, 2.4, 0.4, -1.6, -1.6,
];

fn moisture_from_ffmc(ffmc: f64) -> f64 {
    FFMC_COEFFICIENT * (101.0 - ffmc) / (59.5 + ffmc)
}

fn ffmc_from_moisture(m: f64) -> f64 {
    (59.5 * (250.0 - m) / (FFMC_COEFFICIENT + m)).clamp(0.0, 101.0)
}

/// One hour of fine fuel moisture drying/wetting.
///
/// `prec` is the rain that fell during the hour in mm.
pub fn hourly_ffmc(ffmc_prev: f64, temp: f64, rh: f64, ws: f64, prec: f64) -> f64 {
    let rh = rh.clamp(0.0, 100.0);
    let mut mo = moisture_from_ffmc(ffmc_prev);

    if prec > 0.0 {
        let rf = prec;
        let mut delta =
            42.5 * rf * (-100.0 / (251.0 - mo)).exp() * (1.0 - (-6.93 / rf).exp());
        if mo > 150.0 {
            delta += 0.0015 * (mo - 150.0).powi(2) * rf.sqrt();
        }
        mo = (mo + delta).min(250.0);
    }

    let ed = 0.942 * rh.powf(0.679)
        + 11.0 * ((rh - 100.0) / 10.0).exp()
        + 0.18 * (21.1 - temp) * (1.0 - (-0.115 * rh).exp());

    let m = if mo > ed {
        let ko = 0.424 * (1.0 - (rh / 100.0).powf(1.7))
            + 0.0694 * ws.sqrt() * (1.0 - (rh / 100.0).powi(8));
        let kd = ko * 0.0579 * (0.0365 * temp).exp();
        ed + (mo - ed) * 10f64.powf(-kd)
    } else {
        let ew = 0.618 * rh.powf(0.753)
            + 10.0 * ((rh - 100.0) / 10.0).exp()
            + 0.18 * (21.1 - temp) * (1.0 - (-0.115 * rh).exp());
        if mo < ew {
            let kl = 0.424 * (1.0 - ((100.0 - rh) / 100.0).powf(1.7))
                + 0.0694 * ws.sqrt() * (1.0 - ((100.0 - rh) / 100.0).powi(8));
            let kw = kl * 0.0579 * (0.0365 * temp).exp();
            ew - (ew - mo) * 10f64.powf(-kw)
        } else {
            mo
        }
    };

    ffmc_from_moisture(m)
}

/// Daily duff moisture code update at noon.
///
/// `prec24` is the rain accumulated over the preceding 24 hours.
pub fn daily_dmc(dmc_prev: f64, temp: f64, rh: f64, prec24: f64, month: u32) -> f64 {
    let mut dmc = dmc_prev;
    if prec24 > 1.5 {
        let re = 0.92 * prec24 - 1.27;
        let mo = 20.0 + (5.6348 - dmc / 43.43).exp();
        let b = if dmc <= 33.0 {
            100.0 / (0.5 + 0.3 * dmc)
        } else if dmc <= 65.0 {
            14.0 - 1.3 * dmc.ln()
        } else {
            6.2 * dmc.ln() - 17.2
        };
        let mr = mo + 1000.0 * re / (48.77 + b * re);
        dmc = (43.43 * (5.6348 - (mr - 20.0).ln())).max(0.0);
    }
    let temp = temp.max(-1.1);
    let el = DAY_LENGTH_DMC[(month.clamp(1, 12) - 1) as usize];
    let k = 1.894 * (temp + 1.1) * (100.0 - rh.clamp(0.0, 100.0)) * el * 1e-6;
    dmc + 100.0 * k
}

/// Daily drought code update at noon.
pub fn daily_dc(dc_prev: f64, temp: f64, prec24: f64, month: u32) -> f64 {
    let mut dc = dc_prev;
    if prec24 > 2.8 {
        let rd = 0.83 * prec24 - 1.27;
        let qo = 800.0 * (-dc / 400.0).exp();
        let qr = qo + 3.937 * rd;
        dc = (400.0 * (800.0 / qr).ln()).max(0.0);
    }
    let temp = temp.max(-2.8);
    let lf = DAY_LENGTH_DC[(month.clamp(1, 12) - 1) as usize];
    let v = (0.36 * (temp + 2.8) + lf).max(0.0);
    dc + 0.5 * v
}

/// Initial spread index from FFMC and wind speed.
pub fn isi(ffmc: f64, ws: f64) -> f64 {
    let m = moisture_from_ffmc(ffmc);
    let f_wind = (0.05039 * ws).exp();
    let f_fuel = 91.9 * (-0.1386 * m).exp() * (1.0 + m.powf(5.31) / 4.93e7);
    0.208 * f_wind * f_fuel
}

/// Buildup index from DMC and DC.
pub fn bui(dmc: f64, dc: f64) -> f64 {
    if dmc <= 0.0 && dc <= 0.0 {
        return 0.0;
    }
    if dmc <= 0.4 * dc {
        0.8 * dmc * dc / (dmc + 0.4 * dc)
    } else {
        (dmc - (1.0 - 0.8 * dc / (dmc + 0.4 * dc)) * (0.92 + (0.0114 * dmc).powf(1.7))).max(0.0)
    }
}

/// Fire weather index from ISI and BUI.
pub fn fwi(isi: f64, bui: f64) -> f64 {
    let f_d = if bui > 80.0 {
        1000.0 / (25.0 + 108.64 * (-0.023 * bui).exp())
    } else {
        0.626 * bui.powf(0.809) + 2.0
    };
    let b = 0.1 * isi * f_d;
    if b <= 1.0 {
        b
    } else {
        (2.72 * (0.434 * b.ln()).powf(0.647)).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ffmc_dries_toward_equilibrium() {
        // hot, dry, windy: moisture falls so FFMC climbs hour over hour
        let mut ffmc = 60.0;
        let mut prev = ffmc;
        for _ in 0..48 {
            ffmc = hourly_ffmc(ffmc, 30.0, 20.0, 15.0, 0.0);
            assert!(ffmc >= prev - 1e-9, "ffmc fell from {prev} to {ffmc}");
            prev = ffmc;
        }
        assert!(ffmc > 90.0, "ffmc = {ffmc}");
    }

    #[test]
    fn test_ffmc_rain_wets_fuel() {
        let dry = hourly_ffmc(90.0, 20.0, 40.0, 10.0, 0.0);
        let wet = hourly_ffmc(90.0, 20.0, 40.0, 10.0, 5.0);
        assert!(wet < dry, "wet {wet} should be below dry {dry}");
    }

    #[test]
    fn test_ffmc_stays_in_range() {
        for prec in [0.0, 0.5, 50.0] {
            let f = hourly_ffmc(101.0, 35.0, 5.0, 40.0, prec);
            assert!((0.0..=101.0).contains(&f), "ffmc = {f}");
        }
    }

    #[test]
    fn test_dmc_dc_rain_reduces() {
        let dmc_dry = daily_dmc(40.0, 20.0, 50.0, 0.0, 7);
        let dmc_wet = daily_dmc(40.0, 20.0, 50.0, 20.0, 7);
        assert!(dmc_wet < dmc_dry);
        let dc_dry = daily_dc(300.0, 20.0, 0.0, 7);
        let dc_wet = daily_dc(300.0, 20.0, 20.0, 7);
        assert!(dc_wet < dc_dry);
    }

    #[test]
    fn test_dmc_dc_never_negative() {
        assert!(daily_dmc(0.5, -10.0, 100.0, 80.0, 4) >= 0.0);
        assert!(daily_dc(1.0, -20.0, 120.0, 4) >= 0.0);
    }

    #[test]
    fn test_isi_monotonic_in_wind() {
        assert!(isi(90.0, 20.0) > isi(90.0, 5.0));
    }

    #[test]
    fn test_bui_zero_when_codes_zero() {
        assert_eq!(bui(0.0, 0.0), 0.0);
        assert!(bui(30.0, 200.0) > 0.0);
    }

    #[test]
    fn test_fwi_reference_point() {
        // FFMC 92, WS 15, DMC 50, DC 300: a solid burning day, FWI well
        // above the 1.0 piecewise break
        let i = isi(92.0, 15.0);
        let b = bui(50.0, 300.0);
        let f = fwi(i, b);
        assert!(f > 10.0 && f < 60.0, "fwi = {f}");
    }
}
