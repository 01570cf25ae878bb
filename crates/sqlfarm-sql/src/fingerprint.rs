/// Lower-case hex MD5 of the statement text. Pass the raw statement for the
/// partial (parameterized) form, or the interpolated statement for the full
/// form.
pub fn fingerprint(sql: &str) -> String {
    format!("{:x}", md5::compute(sql.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::fingerprint;

    #[test]
    fn fingerprint_is_md5_hex() {
        assert_eq!(fingerprint(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(fingerprint("abc"), "900150983cd24fb0d6963f7d28e17f72");
        assert_ne!(fingerprint("select 1"), fingerprint("select 2"));
    }
}
